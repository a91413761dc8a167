use serde::Serialize;

/// Status carried by [`OperationResult::no_result`]. Protocol codes are
/// always four digits, so this never collides with a host reply.
pub const NO_RESULT_STATUS: u16 = 0;

/// Uniform envelope returned by every protocol operation.
///
/// `data` is only present when the operation defines a payload for the
/// status the host returned. A local failure (no connection, no session,
/// send or receive failure) is the `no_result` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult<T> {
    pub data: Option<T>,
    pub status_code: u16,
}

impl<T> OperationResult<T> {
    pub fn new(data: Option<T>, status_code: u16) -> Self {
        Self { data, status_code }
    }

    /// The operation could not be attempted or the exchange failed locally
    pub fn no_result() -> Self {
        Self {
            data: None,
            status_code: NO_RESULT_STATUS,
        }
    }

    /// A host reply without payload
    pub fn status(status_code: u16) -> Self {
        Self {
            data: None,
            status_code,
        }
    }

    pub fn is_local_failure(&self) -> bool {
        self.status_code == NO_RESULT_STATUS
    }

    /// Whether the host replied with `code`
    pub fn is(&self, code: u16) -> bool {
        self.status_code == code
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            data: self.data.map(f),
            status_code: self.status_code,
        }
    }
}

impl<T> Default for OperationResult<T> {
    fn default() -> Self {
        Self::no_result()
    }
}
