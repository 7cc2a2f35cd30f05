// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::model::VarianceStatus;

impl VarianceStatus {
    /// The allowed edge set; everything else is an invalid transition.
    pub fn can_transition_to(self, next: VarianceStatus) -> bool {
        use VarianceStatus::*;
        matches!(
            (self, next),
            (Open, UnderReview) | (UnderReview, Resolved) | (UnderReview, Rejected) | (UnderReview, Open)
        )
    }

    /// Resolved and rejected records are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, VarianceStatus::Resolved | VarianceStatus::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VarianceStatus::*;

    const ALL: [VarianceStatus; 4] = [Open, UnderReview, Resolved, Rejected];

    #[test]
    fn test_allowed_edges() {
        assert!(Open.can_transition_to(UnderReview));
        assert!(UnderReview.can_transition_to(Resolved));
        assert!(UnderReview.can_transition_to(Rejected));
        assert!(UnderReview.can_transition_to(Open));
    }

    #[test]
    fn test_everything_else_is_rejected() {
        let allowed = [(Open, UnderReview), (UnderReview, Resolved), (UnderReview, Rejected), (UnderReview, Open)];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [Resolved, Rejected] {
            assert!(from.is_terminal());
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
        assert!(!Open.is_terminal());
        assert!(!UnderReview.is_terminal());
    }
}
