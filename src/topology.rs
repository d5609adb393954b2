//! Ring and tree topologies derived from a survey roster.
//!
//! The roster is the ordered list of cothority members agreed at survey
//! creation. The ring visits members in roster order (each member forwards to
//! its successor) and the tree is the binary tree over the same order, rooted
//! at the first member, the survey coordinator.

use commonware_cryptography::PublicKey;

use crate::Error;

/// The ordered members of a survey's cothority.
#[derive(Clone, Debug)]
pub struct Roster<P: PublicKey> {
    members: Vec<P>,
}

impl<P: PublicKey> Roster<P> {
    /// Validates and wraps an ordered member list.
    pub fn new(members: Vec<P>) -> Result<Self, Error> {
        if members.is_empty() {
            return Err(Error::EmptyRoster);
        }
        for (index, member) in members.iter().enumerate() {
            if members[..index].contains(member) {
                return Err(Error::DuplicateMember);
            }
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[P] {
        &self.members
    }

    /// The survey coordinator: the roster head, root of the tree.
    pub fn coordinator(&self) -> &P {
        &self.members[0]
    }

    pub fn contains(&self, member: &P) -> bool {
        self.members.contains(member)
    }

    fn position(&self, member: &P) -> Option<usize> {
        self.members.iter().position(|candidate| candidate == member)
    }

    /// The next member in ring order, wrapping around at the end.
    pub fn successor(&self, member: &P) -> Option<&P> {
        let position = self.position(member)?;
        Some(&self.members[(position + 1) % self.members.len()])
    }

    /// The member's parent in the tree, `None` for the root.
    pub fn parent(&self, member: &P) -> Option<&P> {
        let position = self.position(member)?;
        if position == 0 {
            return None;
        }
        Some(&self.members[(position - 1) / 2])
    }

    /// The member's children in the tree, possibly empty.
    pub fn children(&self, member: &P) -> Vec<P> {
        let Some(position) = self.position(member) else {
            return Vec::new();
        };
        let mut children = Vec::with_capacity(2);
        for child in [2 * position + 1, 2 * position + 2] {
            if child < self.members.len() {
                children.push(self.members[child].clone());
            }
        }
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PublicKey, PrivateKeyExt, Signer};

    fn members(n: u64) -> Vec<PublicKey> {
        (0..n)
            .map(|seed| {
                commonware_cryptography::ed25519::PrivateKey::from_seed(seed).public_key()
            })
            .collect()
    }

    #[test]
    fn test_empty_roster_rejected() {
        assert!(matches!(
            Roster::<PublicKey>::new(Vec::new()),
            Err(Error::EmptyRoster)
        ));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut list = members(2);
        list.push(list[0].clone());
        assert!(matches!(Roster::new(list), Err(Error::DuplicateMember)));
    }

    #[test]
    fn test_ring_visits_every_member_once() {
        let list = members(5);
        let roster = Roster::new(list.clone()).unwrap();

        let mut visited = vec![roster.coordinator().clone()];
        let mut current = roster.coordinator().clone();
        loop {
            let next = roster.successor(&current).unwrap().clone();
            if next == *roster.coordinator() {
                break;
            }
            visited.push(next.clone());
            current = next;
        }
        assert_eq!(visited, list);
    }

    #[test]
    fn test_singleton_ring() {
        let list = members(1);
        let roster = Roster::new(list.clone()).unwrap();
        assert_eq!(roster.successor(&list[0]), Some(&list[0]));
        assert!(roster.children(&list[0]).is_empty());
        assert!(roster.parent(&list[0]).is_none());
    }

    #[test]
    fn test_tree_parent_child_consistency() {
        let list = members(7);
        let roster = Roster::new(list.clone()).unwrap();

        assert!(roster.parent(roster.coordinator()).is_none());
        let mut reachable = 1;
        for member in &list {
            for child in roster.children(member) {
                assert_eq!(roster.parent(&child), Some(member));
                reachable += 1;
            }
        }
        // Every non-root member is some member's child.
        assert_eq!(reachable, list.len());
    }

    #[test]
    fn test_unknown_member() {
        let roster = Roster::new(members(3)).unwrap();
        let stranger = commonware_cryptography::ed25519::PrivateKey::from_seed(99).public_key();
        assert!(roster.successor(&stranger).is_none());
        assert!(roster.parent(&stranger).is_none());
        assert!(roster.children(&stranger).is_empty());
    }
}
