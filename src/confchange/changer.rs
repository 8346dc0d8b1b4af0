// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use crate::message::{ConfChangeSingle, ConfChangeType};
use crate::tracker::{Configuration, ProgressMap, ProgressTracker};
use crate::{Error, Result};

/// Change log for progress map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChangeType {
    /// A peer starts being tracked.
    Add,
    /// A peer stops being tracked.
    Remove,
}

/// Changes made by `Changer`.
pub type MapChange = Vec<(u64, MapChangeType)>;

/// A view of the progress map with pending additions and removals layered
/// on top, so nothing is touched until the whole change checks out.
struct IncrChangeMap<'a> {
    changes: MapChange,
    base: &'a ProgressMap,
}

impl IncrChangeMap<'_> {
    fn into_changes(self) -> MapChange {
        self.changes
    }

    fn contains(&self, id: u64) -> bool {
        match self.changes.iter().rfind(|(i, _)| *i == id) {
            Some((_, MapChangeType::Remove)) => false,
            Some((_, MapChangeType::Add)) => true,
            None => self.base.contains_key(&id),
        }
    }
}

/// Changer facilitates configuration changes. It exposes methods to handle
/// simple and joint consensus while performing the proper validation that allows
/// refusing invalid configuration changes before they affect the active
/// configuration.
///
/// Every method returns the next configuration together with the progress
/// additions and removals; the caller installs both with
/// `ProgressTracker::apply_conf`.
pub struct Changer<'a> {
    tracker: &'a ProgressTracker,
}

impl Changer<'_> {
    /// Creates a changer.
    pub fn new(tracker: &ProgressTracker) -> Changer {
        Changer { tracker }
    }

    /// Verifies that the outgoing (=right) majority config of the joint
    /// config is empty and initializes it with a copy of the incoming (=left)
    /// majority config. That is, it transitions from
    /// ```text
    ///     (1 2 3)&&()
    /// ```
    /// to
    /// ```text
    ///     (1 2 3)&&(1 2 3)
    /// ```
    ///
    /// The supplied changes are then applied to the incoming majority config,
    /// resulting in a joint configuration that in terms of the Raft thesis
    /// (Section 4.3) corresponds to `C_{new,old}`.
    pub fn enter_joint(
        &self,
        auto_leave: bool,
        ccs: &[ConfChangeSingle],
    ) -> Result<(Configuration, MapChange)> {
        if super::joint(self.tracker.conf()) {
            return Err(Error::ConfigInvalid(
                "configuration is already joint".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        if cfg.voters.incoming.is_empty() {
            // Adding nodes to an empty config is allowed for bootstrap, but
            // an empty config can't become joint.
            return Err(Error::ConfigInvalid(
                "can't make a zero-voter config joint".to_owned(),
            ));
        }
        let incoming: Vec<u64> = cfg.voters.incoming.iter().cloned().collect();
        cfg.voters.outgoing.extend(incoming);
        apply(&mut cfg, &mut prs, ccs)?;
        cfg.auto_leave = auto_leave;
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Transitions out of a joint configuration. It is an error to call this method if
    /// the configuration is not joint, i.e. if the outgoing majority config is empty.
    ///
    /// The outgoing majority config of the joint configuration will be removed, that is,
    /// the incoming config is promoted as the sole decision maker. In the notation of
    /// the Raft thesis (Section 4.3), this method transitions from `C_{new,old}` into
    /// `C_new`.
    ///
    /// At the same time, any staged learners (LearnersNext) the addition of which was
    /// held back by an overlapping voter in the former outgoing config will be inserted
    /// into Learners.
    pub fn leave_joint(&self) -> Result<(Configuration, MapChange)> {
        if !super::joint(self.tracker.conf()) {
            return Err(Error::ConfigInvalid(
                "can't leave a non-joint config".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        let staged: Vec<u64> = cfg.learners_next.drain().collect();
        cfg.learners.extend(staged);

        for id in cfg.voters.outgoing.iter() {
            if !cfg.voters.incoming.contains(id) && !cfg.learners.contains(id) {
                prs.changes.push((*id, MapChangeType::Remove));
            }
        }

        cfg.voters.outgoing.clear();
        cfg.auto_leave = false;
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Carries out a series of configuration changes that (in aggregate) mutates the
    /// incoming majority config Voters[0] by at most one. This method will return an
    /// error if that is not the case, if the resulting quorum is zero, or if the
    /// configuration is in a joint state (i.e. if there is an outgoing configuration).
    pub fn simple(&self, ccs: &[ConfChangeSingle]) -> Result<(Configuration, MapChange)> {
        if super::joint(self.tracker.conf()) {
            return Err(Error::ConfigInvalid(
                "can't apply simple config change in joint config".to_owned(),
            ));
        }
        let (mut cfg, mut prs) = self.check_and_copy()?;
        apply(&mut cfg, &mut prs, ccs)?;
        if cfg
            .voters
            .incoming
            .symmetric_difference(&self.tracker.conf().voters.incoming)
            .count()
            > 1
        {
            return Err(Error::ConfigInvalid(
                "more than one voter changed without entering joint config".to_owned(),
            ));
        }
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs.into_changes()))
    }

    /// Copies the tracker's config. It returns an error if check_invariants does.
    ///
    /// Progress itself is not copied: only additions and removals are recorded,
    /// and the `is_learner` flags are recomputed when the change is installed.
    fn check_and_copy(&self) -> Result<(Configuration, IncrChangeMap)> {
        let prs = IncrChangeMap {
            changes: vec![],
            base: self.tracker.progress(),
        };
        check_invariants(self.tracker.conf(), &prs)?;
        Ok((self.tracker.conf().clone(), prs))
    }
}

/// Applies a change to the configuration. By convention, changes to voters are always
/// made to the incoming majority config. Outgoing is either empty or preserves the
/// outgoing majority configuration while in a joint state.
fn apply(cfg: &mut Configuration, prs: &mut IncrChangeMap, ccs: &[ConfChangeSingle]) -> Result<()> {
    for cc in ccs {
        let id = cc.node_id();
        if id == 0 {
            // A zeroed id marks a change the application decided to skip.
            continue;
        }
        match cc.change_type {
            ConfChangeType::AddNode => make_voter(cfg, prs, id),
            ConfChangeType::AddLearnerNode => make_learner(cfg, prs, id),
            ConfChangeType::RemoveNode => remove(cfg, prs, id),
            // Only peer attributes change, the configuration stays the same.
            ConfChangeType::UpdateNode => {}
        }
    }
    if cfg.voters.incoming.is_empty() {
        return Err(Error::ConfigInvalid("removed all voters".to_owned()));
    }
    Ok(())
}

/// Adds or promotes the given ID to be a voter in the incoming majority config.
fn make_voter(cfg: &mut Configuration, prs: &mut IncrChangeMap, id: u64) {
    if !prs.contains(id) {
        init_progress(cfg, prs, id, false);
        return;
    }

    cfg.voters.incoming.insert(id);
    cfg.learners.remove(&id);
    cfg.learners_next.remove(&id);
}

/// Makes the given ID a learner or stages it to be a learner once an active joint
/// configuration is exited.
///
/// The former happens when the peer is not a part of the outgoing config, in which
/// case we either add a new learner or demote a voter in the incoming config.
///
/// The latter case occurs when the configuration is joint and the peer is a voter
/// in the outgoing config. In that case, we do not want to add the peer as a learner
/// because then we'd have to track a peer as a voter and learner simultaneously.
/// Instead, we add the learner to LearnersNext, so that it will be added to Learners
/// the moment the outgoing config is removed by LeaveJoint().
fn make_learner(cfg: &mut Configuration, prs: &mut IncrChangeMap, id: u64) {
    if !prs.contains(id) {
        init_progress(cfg, prs, id, true);
        return;
    }

    if cfg.learners.contains(&id) {
        return;
    }

    cfg.voters.incoming.remove(&id);
    cfg.learners.remove(&id);
    cfg.learners_next.remove(&id);

    if cfg.voters.outgoing.contains(&id) {
        cfg.learners_next.insert(id);
    } else {
        cfg.learners.insert(id);
    }
}

/// Removes this peer as a voter or learner from the incoming config.
fn remove(cfg: &mut Configuration, prs: &mut IncrChangeMap, id: u64) {
    if !prs.contains(id) {
        return;
    }

    cfg.voters.incoming.remove(&id);
    cfg.learners.remove(&id);
    cfg.learners_next.remove(&id);

    // If the peer is still a voter in the outgoing config, keep the Progress.
    if !cfg.voters.outgoing.contains(&id) {
        prs.changes.push((id, MapChangeType::Remove));
    }
}

/// Initializes a new progress for the given node or learner.
fn init_progress(cfg: &mut Configuration, prs: &mut IncrChangeMap, id: u64, is_learner: bool) {
    if !is_learner {
        cfg.voters.incoming.insert(id);
    } else {
        cfg.learners.insert(id);
    }
    prs.changes.push((id, MapChangeType::Add));
}

/// Makes sure that the config and progress are compatible with each other.
/// This is used to check both what the Changer is initialized with, as well
/// as what it returns.
fn check_invariants(cfg: &Configuration, prs: &IncrChangeMap) -> Result<()> {
    // The empty config is allowed so that a group can be bootstrapped from it.
    for id in cfg.voters.ids() {
        if !prs.contains(id) {
            return Err(Error::ConfigInvalid(format!(
                "no progress for voter {}",
                id
            )));
        }
    }
    for id in &cfg.learners {
        if !prs.contains(*id) {
            return Err(Error::ConfigInvalid(format!(
                "no progress for learner {}",
                id
            )));
        }
        // Conversely Learners and Voters doesn't intersect at all.
        if cfg.voters.outgoing.contains(id) {
            return Err(Error::ConfigInvalid(format!(
                "{} is in learners and outgoing voters",
                id
            )));
        }
        if cfg.voters.incoming.contains(id) {
            return Err(Error::ConfigInvalid(format!(
                "{} is in learners and incoming voters",
                id
            )));
        }
    }
    for id in &cfg.learners_next {
        if !prs.contains(*id) {
            return Err(Error::ConfigInvalid(format!(
                "no progress for learner(next) {}",
                id
            )));
        }

        // Any staged learner was staged because it could not be directly added due
        // to a conflicting voter in the outgoing config.
        if !cfg.voters.outgoing.contains(id) {
            return Err(Error::ConfigInvalid(format!(
                "{} is in learners_next but not in outgoing voters",
                id
            )));
        }
        if cfg.learners.contains(id) {
            return Err(Error::ConfigInvalid(format!(
                "{} is in learners_next and learners",
                id
            )));
        }
    }

    if !super::joint(cfg) {
        if !cfg.learners_next.is_empty() {
            return Err(Error::ConfigInvalid(
                "learners_next must be empty when not joint".to_owned(),
            ));
        }
        if cfg.auto_leave {
            return Err(Error::ConfigInvalid(
                "auto_leave must be false when not joint".to_owned(),
            ));
        }
    }

    Ok(())
}
