//! Lookup completion callbacks.
//!
//! Both methods consume the boxed callback, so a lookup answers each caller
//! exactly once with either a result list or an error.

use tokio::sync::oneshot;

use capdir_core::{DiscoveryEntryWithMetaInfo, LookupError};

pub type LookupResult = Result<Vec<DiscoveryEntryWithMetaInfo>, LookupError>;

pub trait LookupCallback: Send + 'static {
    fn on_success(self: Box<Self>, entries: Vec<DiscoveryEntryWithMetaInfo>);
    fn on_error(self: Box<Self>, error: LookupError);
}

/// Answers a future. A receiver that was dropped makes delivery a no-op.
impl LookupCallback for oneshot::Sender<LookupResult> {
    fn on_success(self: Box<Self>, entries: Vec<DiscoveryEntryWithMetaInfo>) {
        let _ = (*self).send(Ok(entries));
    }

    fn on_error(self: Box<Self>, error: LookupError) {
        let _ = (*self).send(Err(error));
    }
}

/// A pair of closures.
pub struct FnCallback<S, E> {
    success: S,
    error: E,
}

impl<S, E> LookupCallback for FnCallback<S, E>
where
    S: FnOnce(Vec<DiscoveryEntryWithMetaInfo>) + Send + 'static,
    E: FnOnce(LookupError) + Send + 'static,
{
    fn on_success(self: Box<Self>, entries: Vec<DiscoveryEntryWithMetaInfo>) {
        (self.success)(entries)
    }

    fn on_error(self: Box<Self>, error: LookupError) {
        (self.error)(error)
    }
}

pub fn from_fns<S, E>(success: S, error: E) -> Box<dyn LookupCallback>
where
    S: FnOnce(Vec<DiscoveryEntryWithMetaInfo>) + Send + 'static,
    E: FnOnce(LookupError) + Send + 'static,
{
    Box::new(FnCallback { success, error })
}

/// Deliver a finished result to a callback.
pub(crate) fn deliver(callback: Box<dyn LookupCallback>, result: LookupResult) {
    match result {
        Ok(entries) => callback.on_success(entries),
        Err(e) => callback.on_error(e),
    }
}
