use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `what` names the missing thing ("Slot", "Target slot", ...).
    NotFound(&'static str, Ulid),
    /// Not found, with a message of its own.
    Missing(&'static str),
    AlreadyExists(&'static str, String),
    Forbidden(&'static str),
    Blackout(&'static str),
    Restricted(&'static str),
    InsufficientCapacity {
        available: u32,
        requested: u32,
        moving: bool,
    },
    CapacityBelowBooked {
        capacity: u32,
        booked: u32,
    },
    Invalid(String),
    InvalidState(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Invalid(msg.into())
    }

    /// SQLSTATE reported to clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) | EngineError::Missing(_) => "P0002",
            EngineError::AlreadyExists(..) => "23505",
            EngineError::Forbidden(_) | EngineError::Blackout(_) | EngineError::Restricted(_) => "42501",
            EngineError::InsufficientCapacity { .. } | EngineError::CapacityBelowBooked { .. } => "23514",
            EngineError::Invalid(_) => "22023",
            EngineError::InvalidState(_) => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for booking-rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) | EngineError::Missing(_) => "not_found",
            EngineError::AlreadyExists(..) => "duplicate",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Blackout(_) => "blackout",
            EngineError::Restricted(_) => "restricted",
            EngineError::InsufficientCapacity { .. } | EngineError::CapacityBelowBooked { .. } => "capacity",
            EngineError::Invalid(_) => "invalid",
            EngineError::InvalidState(_) => "state",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(what, key) => write!(f, "{what} already exists: {key}"),
            EngineError::Missing(msg)
            | EngineError::Forbidden(msg)
            | EngineError::Blackout(msg)
            | EngineError::Restricted(msg)
            | EngineError::InvalidState(msg) => write!(f, "{msg}"),
            EngineError::InsufficientCapacity { available, requested, moving } => {
                let lead = if *moving { "Target slot at capacity" } else { "Insufficient capacity" };
                write!(f, "{lead}. Available: {available}, Requested: {requested}")
            }
            EngineError::CapacityBelowBooked { capacity, booked } => write!(
                f,
                "capacity {capacity} is below the {booked} already booked"
            ),
            EngineError::Invalid(msg) => write!(f, "{msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
