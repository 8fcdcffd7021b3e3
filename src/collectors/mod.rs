pub mod aggregate;
pub mod fleet;
pub mod runner;
pub mod suite;

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
}
