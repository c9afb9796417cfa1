//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process identifiers and ports from being
//! mixed up with the many other integers flowing through discovery.

use std::fmt;

/// Process ID
///
/// Represents a process ID (TGID) in the system. Kept signed to match
/// `pid_t`, which is what the kernel attach APIs take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// Listening TCP port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(pub u16);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(i32::from(Pid::from(7)), 7);
    }
}
