//! Path-keyed cache of appliance sessions.
//!
//! Launching the appliance costs seconds; one operation reuses a session
//! per image. Requesting a writable session while a read-only one is
//! cached closes the stale one first, so there is never more than one
//! view of an image inside the process.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use crate::common::process::{Executor, Runner};
use crate::error::Result;
use crate::guestfs::Session;

pub struct SessionPool {
    runner: Runner,
    executor: Arc<dyn Executor>,
    sessions: RefCell<HashMap<PathBuf, Rc<Session>>>,
}

impl SessionPool {
    pub fn new(runner: Runner, executor: Arc<dyn Executor>) -> Self {
        SessionPool {
            runner,
            executor,
            sessions: RefCell::new(HashMap::new()),
        }
    }

    pub fn get_ro(&self, image: &Path) -> Result<Rc<Session>> {
        self.get(image, true)
    }

    pub fn get_rw(&self, image: &Path) -> Result<Rc<Session>> {
        self.get(image, false)
    }

    fn get(&self, image: &Path, readonly: bool) -> Result<Rc<Session>> {
        self.runner.check_cancelled()?;

        let mut sessions = self.sessions.borrow_mut();
        if let Some(session) = sessions.get(image) {
            // A writable session serves reads too; only the RO→RW
            // promotion closes the cached session first.
            if session.is_readonly() == readonly || !session.is_readonly() {
                return Ok(Rc::clone(session));
            }
            sessions.remove(image);
        }

        let session = Rc::new(if readonly {
            Session::open_ro(image, self.runner.clone(), Arc::clone(&self.executor))?
        } else {
            Session::open_rw(image, self.runner.clone(), Arc::clone(&self.executor))?
        });
        sessions.insert(image.to_path_buf(), Rc::clone(&session));
        Ok(session)
    }

    /// Drop every cached session, shutting the appliances down. Must run
    /// before an external tool mutates any of the images.
    pub fn close_all(&self) {
        self.sessions.borrow_mut().clear();
    }

    /// Flush outstanding writes of every cached session, then close them.
    pub fn sync_and_close_all(&self) -> Result<()> {
        for session in self.sessions.borrow().values() {
            session.sync()?;
        }
        self.close_all();
        Ok(())
    }
}
