//! Running a site on its own thread.

use crate::{ExecutionSite, SiteError};
use lockstep_core::Mailbox;
use lockstep_types::SiteId;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::error;

/// A site running on a dedicated thread.
pub struct SiteHandle<M: Mailbox> {
    site_id: SiteId,
    thread: JoinHandle<(ExecutionSite<M>, Result<(), SiteError>)>,
}

/// Start `site` on a thread named `site-<id>`.
///
/// The thread runs until the site is poisoned or hits a fatal error.
pub fn spawn_site<M>(site: ExecutionSite<M>) -> io::Result<SiteHandle<M>>
where
    M: Mailbox + Send + 'static,
{
    let site_id = site.site_id();
    let thread = thread::Builder::new()
        .name(format!("site-{}", site_id.0))
        .spawn(move || {
            let mut site = site;
            let result = site.run_loop();
            (site, result)
        })?;
    Ok(SiteHandle { site_id, thread })
}

impl<M: Mailbox> SiteHandle<M> {
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the site to stop and hand it back with its exit status.
    ///
    /// A panicked site thread is reported as `None`.
    pub fn join(self) -> Option<(ExecutionSite<M>, Result<(), SiteError>)> {
        match self.thread.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!(site = %self.site_id, "Site thread panicked");
                None
            }
        }
    }
}
