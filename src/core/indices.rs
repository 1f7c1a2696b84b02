use std::collections::BTreeMap;

use hashbrown::HashSet;

use crate::types::{MutationId, MutationSeq, RecordKey};

/// Enqueue order, oldest first.
pub type SeqOrder = BTreeMap<MutationSeq, MutationId>;

/// Set of record keys, e.g. targets with a mutation in flight.
pub type KeySet = HashSet<RecordKey>;
