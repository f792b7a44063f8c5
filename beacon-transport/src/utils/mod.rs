mod rate_limits;

pub use self::rate_limits::*;
