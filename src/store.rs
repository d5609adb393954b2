//! Per-survey staged queues between pipeline phases.
//!
//! Rows move through the store in explicit drain/push steps, one per pipeline
//! phase, so that each row flows through every phase exactly once and no row
//! is visible to two phases at the same time. Operations attempted out of
//! order fail with [Error::WrongPhase].

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::mem;

use crate::cipher::{CipherVector, DeterministicCipherVector, GroupingAttributes};
use crate::types::{ClientResponse, RowId, SurveyDescription, SurveyResult};
use crate::Error;

/// Pipeline lifecycle of a survey on this server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Collecting,
    Grouping,
    Aggregating,
    KeySwitching,
    Done,
}

/// The staged buffers of one survey.
pub struct Store {
    description: SurveyDescription,
    phase: Phase,

    /// Rows as submitted, awaiting the next grouping phase.
    collected: Vec<ClientResponse>,

    /// Rows drained for grouping, keyed by the identifier under which their
    /// grouping attributes travel the ring.
    pending_rows: HashMap<RowId, ClientResponse>,

    /// Aggregate vectors summed per deterministic label, local to this server.
    locally_aggregated: HashMap<GroupingAttributes, CipherVector>,

    /// Groups summed across the whole cothority (coordinator only).
    cothority_aggregated: HashMap<GroupingAttributes, CipherVector>,

    /// Row identifiers in flight through the final switching phase.
    switching_rows: HashSet<RowId>,

    /// Results under the querier key, ready for delivery.
    results: Vec<SurveyResult>,
}

impl Store {
    pub fn new(description: SurveyDescription) -> Self {
        Self {
            description,
            phase: Phase::Created,
            collected: Vec::new(),
            pending_rows: HashMap::new(),
            locally_aggregated: HashMap::new(),
            cothority_aggregated: HashMap::new(),
            switching_rows: HashSet::new(),
            results: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Appends a client row to the collected queue after validating its shape
    /// against the survey description.
    pub fn insert_client_response(&mut self, response: ClientResponse) -> Result<(), Error> {
        let grouping = self.description.grouping_attributes as usize;
        if response.grouping.len() != grouping {
            return Err(Error::InvalidDimensions {
                expected: grouping,
                actual: response.grouping.len(),
            });
        }
        let aggregates = self.description.aggregate_attributes as usize;
        if response.aggregates.len() != aggregates {
            return Err(Error::InvalidDimensions {
                expected: aggregates,
                actual: response.aggregates.len(),
            });
        }
        self.collected.push(response);
        if matches!(self.phase, Phase::Created | Phase::Done) {
            self.phase = Phase::Collecting;
        }
        Ok(())
    }

    /// Drains the collected rows, assigning each a fresh row identifier, and
    /// returns the grouping-attribute projections to feed the deterministic
    /// switching ring. The rows themselves are retained for the join-back.
    pub fn poll_probabilistic_grouping_attributes<R: Rng>(
        &mut self,
        rng: &mut R,
    ) -> Result<HashMap<RowId, CipherVector>, Error> {
        if matches!(self.phase, Phase::Grouping | Phase::KeySwitching) {
            return Err(Error::WrongPhase(self.phase));
        }
        let mut projections = HashMap::with_capacity(self.collected.len());
        for response in self.collected.drain(..) {
            let id = RowId::random(rng);
            projections.insert(id, response.grouping.clone());
            self.pending_rows.insert(id, response);
        }
        self.phase = Phase::Grouping;
        Ok(projections)
    }

    /// Joins the deterministic labels back to the retained rows and folds
    /// each row's aggregates into the local per-group sums.
    pub fn push_deterministic_grouping_attributes(
        &mut self,
        labels: HashMap<RowId, GroupingAttributes>,
    ) -> Result<(), Error> {
        if self.phase != Phase::Grouping {
            return Err(Error::WrongPhase(self.phase));
        }
        if labels.len() != self.pending_rows.len() {
            return Err(Error::RowMismatch);
        }
        for id in labels.keys() {
            if !self.pending_rows.contains_key(id) {
                return Err(Error::UnknownRow(*id));
            }
        }
        for (id, attributes) in labels {
            let row = self.pending_rows.remove(&id).expect("row validated above");
            match self.locally_aggregated.get_mut(&attributes) {
                Some(sum) => sum.add(&row.aggregates)?,
                None => {
                    self.locally_aggregated.insert(attributes, row.aggregates);
                }
            }
        }
        self.phase = Phase::Aggregating;
        Ok(())
    }

    /// Drains this server's contribution to the aggregation tree. Valid in
    /// any phase: a server that collected nothing still participates with an
    /// empty contribution.
    pub fn poll_locally_aggregated_responses(&mut self) -> HashMap<GroupingAttributes, CipherVector> {
        mem::take(&mut self.locally_aggregated)
    }

    /// Records the cothority-wide sums produced by the aggregation tree.
    pub fn push_cothority_aggregated_groups(
        &mut self,
        groups: HashMap<GroupingAttributes, CipherVector>,
    ) -> Result<(), Error> {
        if self.phase != Phase::Aggregating {
            return Err(Error::WrongPhase(self.phase));
        }
        self.cothority_aggregated = groups;
        self.phase = Phase::KeySwitching;
        Ok(())
    }

    /// Drains the cothority-aggregated groups, assigning each a fresh row
    /// identifier so the labels and the sums can be switched to the querier
    /// key in parallel and rejoined afterwards.
    #[allow(clippy::type_complexity)]
    pub fn poll_cothority_aggregated_groups<R: Rng>(
        &mut self,
        rng: &mut R,
    ) -> Result<
        (
            HashMap<RowId, DeterministicCipherVector>,
            HashMap<RowId, CipherVector>,
        ),
        Error,
    > {
        if self.phase != Phase::KeySwitching {
            return Err(Error::WrongPhase(self.phase));
        }
        let mut groups = HashMap::with_capacity(self.cothority_aggregated.len());
        let mut aggregates = HashMap::with_capacity(self.cothority_aggregated.len());
        for (attributes, sum) in self.cothority_aggregated.drain() {
            let id = RowId::random(rng);
            groups.insert(id, DeterministicCipherVector::from(attributes));
            aggregates.insert(id, sum);
            self.switching_rows.insert(id);
        }
        Ok((groups, aggregates))
    }

    /// Joins the querier-key encryptions of the labels and the sums back into
    /// deliverable results.
    pub fn push_querier_key_encrypted_data(
        &mut self,
        groups: HashMap<RowId, CipherVector>,
        aggregates: HashMap<RowId, CipherVector>,
    ) -> Result<(), Error> {
        if self.phase != Phase::KeySwitching {
            return Err(Error::WrongPhase(self.phase));
        }
        if groups.len() != self.switching_rows.len() || aggregates.len() != groups.len() {
            return Err(Error::RowMismatch);
        }
        for id in groups.keys() {
            if !self.switching_rows.contains(id) || !aggregates.contains_key(id) {
                return Err(Error::UnknownRow(*id));
            }
        }
        let mut aggregates = aggregates;
        for (id, grouping) in groups {
            let summed = aggregates.remove(&id).expect("row validated above");
            self.results.push(SurveyResult {
                grouping,
                aggregates: summed,
            });
        }
        self.switching_rows.clear();
        self.phase = Phase::Done;
        Ok(())
    }

    /// Drains the deliverable results.
    pub fn poll_deliverable_results(&mut self) -> Result<Vec<SurveyResult>, Error> {
        if self.phase != Phase::Done {
            return Err(Error::WrongPhase(self.phase));
        }
        Ok(mem::take(&mut self.results))
    }
}
