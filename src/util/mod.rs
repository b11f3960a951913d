pub mod clock;
pub mod readiness;
pub mod timeout;
