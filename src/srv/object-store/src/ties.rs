use std::collections::{BTreeMap, BTreeSet};

use objspace_rt_abi::object::ObjID;

/// Tie bookkeeping: for each object, the set of objects it keeps alive.
#[derive(Default, Debug)]
pub(crate) struct Ties {
    ties: BTreeMap<ObjID, BTreeSet<ObjID>>,
}

impl Ties {
    pub fn insert_ties(&mut self, obj: ObjID, deps: impl IntoIterator<Item = ObjID>) {
        for val in deps.into_iter() {
            tracing::trace!("insert tie from {} to {}", obj, val);
            self.ties.entry(obj).or_default().insert(val);
        }
    }

    pub fn remove_all_ties(&mut self, obj: ObjID) {
        self.ties.remove(&obj);
    }

    /// An object that currently holds a tie on `target`, if any.
    pub fn tied_by(&self, target: ObjID) -> Option<ObjID> {
        self.ties
            .iter()
            .find(|(_, set)| set.contains(&target))
            .map(|(obj, _)| *obj)
    }

    pub fn ties_of(&self, obj: ObjID) -> Vec<ObjID> {
        self.ties
            .get(&obj)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
