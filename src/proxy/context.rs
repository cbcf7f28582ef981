// Per-request context carried through the Pingora phases

use uuid::Uuid;

use crate::middleware::RequestTimer;

#[derive(Debug)]
pub struct ProxyContext {
    request_id: String,
    /// Set only for requests delegated to the tile server
    timer: Option<RequestTimer>,
}

impl ProxyContext {
    /// Generates a unique request ID (UUID v4)
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timer: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn start(&mut self, timer: RequestTimer) {
        self.timer = Some(timer);
    }

    pub fn timer_mut(&mut self) -> Option<&mut RequestTimer> {
        self.timer.as_mut()
    }

    /// Take the timer so it records exactly once
    pub fn take_timer(&mut self) -> Option<RequestTimer> {
        self.timer.take()
    }
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self::new()
    }
}
