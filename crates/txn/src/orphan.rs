//! The coordinator-failure rule.

use crate::Decision;
use lockstep_types::TxnId;

/// Decide the fate of a participant whose coordinator died mid-transaction.
///
/// `globally_committed` is the newest multi-partition transaction this site
/// knows committed somewhere. Ids are issued in time order and the
/// coordinator only commits after every participant finished its work, so a
/// transaction at or below that point committed everywhere it was applied.
/// Anything newer may never have been decided and rolls back.
pub fn decide_orphan_outcome(txn_id: TxnId, globally_committed: TxnId) -> Decision {
    if txn_id <= globally_committed {
        Decision::Commit
    } else {
        Decision::Rollback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commits_at_or_below_known_global_commit() {
        let g = TxnId(1000);
        assert_eq!(decide_orphan_outcome(TxnId(999), g), Decision::Commit);
        assert_eq!(decide_orphan_outcome(TxnId(1000), g), Decision::Commit);
        assert_eq!(decide_orphan_outcome(TxnId(1001), g), Decision::Rollback);
    }

    #[test]
    fn test_nothing_committed_rolls_back() {
        assert_eq!(decide_orphan_outcome(TxnId(1), TxnId::NONE), Decision::Rollback);
    }
}
