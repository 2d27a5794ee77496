//! Message subjects used for mailbox multiplexing

use crate::WireError;

/// Coarse message category. A mailbox keeps one queue per subject so that
/// failure traffic can be drained ahead of ordinary traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Subject {
    /// Ordinary traffic
    Default = 0,
    /// Locally derived failure notification
    Failure = 1,
    /// Failure update from a host that witnessed the failure
    FailureSiteUpdate = 2,
    /// Failure update relayed on behalf of another host
    SiteFailureForward = 3,
}

impl Subject {
    pub const COUNT: usize = 4;

    pub const ALL: [Subject; Subject::COUNT] = [
        Subject::Default,
        Subject::Failure,
        Subject::FailureSiteUpdate,
        Subject::SiteFailureForward,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_u8(id: u8) -> Result<Self, WireError> {
        match id {
            0 => Ok(Subject::Default),
            1 => Ok(Subject::Failure),
            2 => Ok(Subject::FailureSiteUpdate),
            3 => Ok(Subject::SiteFailureForward),
            other => Err(WireError::UnknownSubject(other)),
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for Subject {
    fn default() -> Self {
        Subject::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_ids() {
        for subject in Subject::ALL {
            assert_eq!(Subject::from_u8(subject.id()).unwrap(), subject);
        }
        assert!(matches!(
            Subject::from_u8(9),
            Err(WireError::UnknownSubject(9))
        ));
    }
}
