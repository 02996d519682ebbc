//! Per-slice query queues
//!
//! A transaction holds one FIFO of queries per slice. The Planner drains
//! the heads of all queues in lockstep; each query's result is kept under
//! the [`QueryId`] returned when it was added.

use crate::error::{PimError, Result};
use crate::query::{Query, QueryKind, QueryResult, Target};
use std::collections::{HashMap, VecDeque};

/// Handle to a query of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u32);

#[derive(Debug)]
struct Entry {
    id: QueryId,
    query: Query,
}

/// Per-slice query queues
#[derive(Debug)]
pub struct Transaction {
    queues: Vec<VecDeque<Entry>>,
    results: HashMap<QueryId, QueryResult>,
    next_id: u32,
}

impl Transaction {
    /// Empty transaction for a rank with `nr_slices` slices.
    pub fn new(nr_slices: usize) -> Self {
        Self {
            queues: (0..nr_slices).map(|_| VecDeque::new()).collect(),
            results: HashMap::new(),
            next_id: 0,
        }
    }

    /// Number of slices.
    pub fn nr_slices(&self) -> usize {
        self.queues.len()
    }

    fn queue_for(&mut self, slice: u8) -> Result<&mut VecDeque<Entry>> {
        let nr = self.queues.len();
        self.queues.get_mut(usize::from(slice)).ok_or_else(|| {
            PimError::internal(format!("slice {slice} outside transaction of {nr} slices"))
        })
    }

    fn allocate_id(&mut self) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Queue `query` behind the pending queries of its slice.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the target slice does not exist.
    pub fn add_tail(&mut self, query: Query) -> Result<QueryId> {
        self.queue_for(query.target().slice())?;
        let id = self.allocate_id();
        self.queue_for(query.target().slice())?
            .push_back(Entry { id, query });
        Ok(id)
    }

    /// Queue `query` ahead of the pending queries of its slice.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the target slice does not exist.
    pub fn add_head(&mut self, query: Query) -> Result<QueryId> {
        self.queue_for(query.target().slice())?;
        let id = self.allocate_id();
        self.queue_for(query.target().slice())?
            .push_front(Entry { id, query });
        Ok(id)
    }

    /// Shorthand for `add_tail(Query::new(target, kind))`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the target slice does not exist.
    pub fn push(&mut self, target: Target, kind: QueryKind) -> Result<QueryId> {
        self.add_tail(Query::new(target, kind))
    }

    /// Detach a pending query.
    pub fn remove(&mut self, id: QueryId) -> Option<Query> {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|e| e.id == id) {
                return queue.remove(pos).map(|e| e.query);
            }
        }
        None
    }

    /// Drop every pending query of `slice`. Returns how many were dropped.
    pub fn free_all_for_slice(&mut self, slice: u8) -> usize {
        self.queues
            .get_mut(usize::from(slice))
            .map_or(0, |q| q.drain(..).count())
    }

    /// Drop every pending query.
    pub fn discard_pending(&mut self) -> usize {
        self.queues.iter_mut().map(|q| q.drain(..).count()).sum()
    }

    /// No query is pending.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Pending queries on `slice`.
    pub fn pending(&self, slice: u8) -> usize {
        self.queues.get(usize::from(slice)).map_or(0, VecDeque::len)
    }

    /// Result of a completed query.
    pub fn result(&self, id: QueryId) -> Option<&QueryResult> {
        self.results.get(&id)
    }

    /// Head query of `slice`.
    pub(crate) fn head_mut(&mut self, slice: usize) -> Option<&mut Query> {
        self.queues.get_mut(slice)?.front_mut().map(|e| &mut e.query)
    }

    /// Retire the head query of `slice` and keep its result.
    pub(crate) fn complete_head(&mut self, slice: usize) {
        if let Some(entry) = self.queues.get_mut(slice).and_then(VecDeque::pop_front) {
            self.results.insert(entry.id, entry.query.into_result());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pim_ufi::DpuId;

    #[test]
    fn head_and_tail_order() {
        let mut txn = Transaction::new(2);
        let a = txn.push(Target::All(0), QueryKind::ReadRun).unwrap();
        let b = txn.push(Target::All(0), QueryKind::ReadFault).unwrap();
        let c = txn
            .add_head(Query::new(Target::All(0), QueryKind::Identity))
            .unwrap();
        assert_eq!(txn.pending(0), 3);
        assert_eq!(txn.head_mut(0).map(|q| q.kind().clone()), Some(QueryKind::Identity));

        txn.complete_head(0);
        assert!(txn.result(c).is_some());
        assert!(txn.result(a).is_none());
        assert!(txn.remove(b).is_some());
        assert_eq!(txn.pending(0), 1);
    }

    #[test]
    fn unknown_slice_rejected() {
        let mut txn = Transaction::new(2);
        let err = txn
            .push(Target::Dpu(DpuId::new(4, 0)), QueryKind::ReadRun)
            .unwrap_err();
        assert!(matches!(err, PimError::Internal { .. }));
    }

    #[test]
    fn free_slice() {
        let mut txn = Transaction::new(2);
        txn.push(Target::All(1), QueryKind::ReadRun).unwrap();
        txn.push(Target::All(1), QueryKind::ReadRun).unwrap();
        txn.push(Target::All(0), QueryKind::ReadRun).unwrap();
        assert_eq!(txn.free_all_for_slice(1), 2);
        assert_eq!(txn.pending(1), 0);
        assert!(!txn.is_empty());
        assert_eq!(txn.discard_pending(), 1);
        assert!(txn.is_empty());
    }
}
