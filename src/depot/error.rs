use ulid::Ulid;

#[derive(Debug)]
pub enum DepotError {
    /// Record kind ("booking", "unit", "customer", ...) plus the missing id.
    NotFound(&'static str, Ulid),
    /// The record exists but is owned by a different tenant.
    Unauthorized(&'static str, Ulid),
    /// Optimistic version check failed on the named record.
    Conflict(&'static str, Ulid),
    /// A precondition or state-machine rule was violated.
    InvalidState(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for DepotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepotError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            DepotError::Unauthorized(kind, id) => {
                write!(f, "{kind} {id} does not belong to the requesting tenant")
            }
            DepotError::Conflict(kind, id) => {
                if *kind == "unit" {
                    write!(
                        f,
                        "storage unit {id} was just booked by another customer; select another unit"
                    )
                } else {
                    write!(f, "{kind} {id} was updated concurrently; retry with the latest version")
                }
            }
            DepotError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            DepotError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            DepotError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for DepotError {}
