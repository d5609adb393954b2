//! The service engine run by every cothority member.
//!
//! One engine per server. It owns the server's ElGamal key share, the
//! per-survey secrets and staged queues, and speaks three network channels:
//! control (flush coordination), switching (the three ring protocols), and
//! aggregation (the tree protocol).
//!
//! Ring hops are stateless: a member that receives a switching message
//! applies its partial transformation and forwards to its ring successor. All
//! protocol state lives at instance roots: the initiator of a ring instance
//! recognizes termination when the message carries its own identity, and a
//! tree node holds a fold only while it awaits children. The coordinator's
//! results pipeline is a state machine advanced by instance feedback:
//! grouping (flush fan-out plus its own deterministic switching), private
//! aggregation, then key switching of the sums in parallel with
//! probabilistic switching of the group labels.

use commonware_codec::{DecodeExt, Encode};
use commonware_cryptography::{
    bls12381::primitives::group::{Scalar, G1},
    PublicKey,
};
use commonware_macros::select;
use commonware_p2p::{Receiver, Recipients, Sender};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{channel::mpsc, channel::oneshot, StreamExt};
use rand::{CryptoRng, Rng};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::cipher::{CipherVector, GroupingAttributes};
use crate::config::Config;
use crate::ingress::{Mailbox, Message};
use crate::metrics;
use crate::store::Store;
use crate::topology::Roster;
use crate::types::{
    Aggregation, ChildAggregatedData, ClientResponse, Control, DataReference,
    DeterministicSwitched, KeySwitchedCipher, ProbabilisticSwitched, RowId, SurveyDescription,
    SurveyId, SurveyResult, Switching,
};
use crate::Error;

/// Encodes and sends a message, mapping transport failures to [Error].
async fn send<S: Sender, M: Encode>(
    sender: &mut S,
    recipients: Recipients<S::PublicKey>,
    message: &M,
    priority: bool,
) -> Result<Vec<S::PublicKey>, Error> {
    sender
        .send(recipients, message.encode().into(), priority)
        .await
        .map_err(|_| Error::UnableToSendMessage)
}

/// One survey as known to this server.
struct Survey<P: PublicKey> {
    roster: Roster<P>,
    /// This server's per-survey secret. Zeroized on drop by the scalar type.
    secret: Scalar,
    store: Store,
}

/// Fold state held by a tree node while it awaits its children.
struct Fold<P: PublicKey> {
    accumulator: HashMap<GroupingAttributes, CipherVector>,
    outstanding: HashSet<P>,
}

/// Pipeline stage of an active results query at the coordinator.
enum Stage<P: PublicKey> {
    /// Awaiting flush acks from members and this server's own labels.
    Grouping { outstanding: HashSet<P> },
    /// Awaiting the aggregation tree to fold up to the root.
    Aggregating,
    /// Awaiting the two final switching rings.
    Switching {
        groups: Option<HashMap<RowId, CipherVector>>,
        aggregates: Option<HashMap<RowId, CipherVector>>,
    },
}

/// An active results query at the coordinator.
struct Query<P: PublicKey> {
    querier: G1,
    responder: oneshot::Sender<Result<Vec<SurveyResult>, Error>>,
    stage: Stage<P>,
}

/// Instance of the main engine for the module.
pub struct Engine<E: Clock + Spawner + Metrics + Rng + CryptoRng, P: PublicKey> {
    // Configuration
    context: E,
    public_key: P,
    share: Scalar,
    priority: bool,

    // Messaging
    mailbox: mpsc::Receiver<Message<P>>,

    // State
    surveys: HashMap<SurveyId, Survey<P>>,
    folds: HashMap<SurveyId, Fold<P>>,
    queries: HashMap<SurveyId, Query<P>>,

    // Metrics
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + Metrics + Rng + CryptoRng, P: PublicKey> Engine<E, P> {
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending messages to the engine.
    pub fn new(context: E, cfg: Config<P>) -> (Self, Mailbox<P>) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());

        (
            Self {
                context,
                public_key: cfg.public_key,
                share: cfg.share,
                priority: cfg.priority,
                mailbox: mailbox_receiver,
                surveys: HashMap::new(),
                folds: HashMap::new(),
                queries: HashMap::new(),
                metrics,
            },
            mailbox,
        )
    }

    /// Starts the engine with the given networks.
    pub fn start(
        mut self,
        control: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
        switching: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
        aggregation: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
    ) -> Handle<()> {
        self.context.spawn_ref()(self.run(control, switching, aggregation))
    }

    /// Inner run loop called by `start`.
    async fn run(
        mut self,
        control: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
        switching: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
        aggregation: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
    ) {
        let (mut control_tx, mut control_rx) = control;
        let (mut switching_tx, mut switching_rx) = switching;
        let (mut aggregation_tx, mut aggregation_rx) = aggregation;
        let mut shutdown = self.context.stopped();

        loop {
            select! {
                // Handle shutdown signal
                _ = &mut shutdown => {
                    debug!("shutdown");
                    break;
                },

                // Handle mailbox messages
                mail = self.mailbox.next() => {
                    let Some(mail) = mail else {
                        error!("mailbox receiver failed");
                        break;
                    };
                    match mail {
                        Message::Create { survey, roster, description, responder } => {
                            let result = self.handle_create(survey, roster, description);
                            let _ = responder.send(result);
                        }
                        Message::Submit { survey, response, responder } => {
                            let result = self.handle_submit(survey, response);
                            let _ = responder.send(result);
                        }
                        Message::Results { survey, querier, responder } => {
                            self.handle_results(
                                &mut control_tx,
                                &mut switching_tx,
                                &mut aggregation_tx,
                                survey,
                                querier,
                                responder,
                            ).await;
                        }
                    }
                },

                // Handle control messages
                incoming = control_rx.recv() => {
                    let (peer, bytes) = match incoming {
                        Ok(incoming) => incoming,
                        Err(err) => {
                            error!(?err, "control receiver failed");
                            break;
                        }
                    };
                    let message = match Control::decode(bytes) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(?err, ?peer, "failed to decode control message");
                            self.metrics.failures.inc();
                            continue;
                        }
                    };
                    self.handle_control(
                        &mut control_tx,
                        &mut switching_tx,
                        &mut aggregation_tx,
                        peer,
                        message,
                    ).await;
                },

                // Handle ring messages
                incoming = switching_rx.recv() => {
                    let (peer, bytes) = match incoming {
                        Ok(incoming) => incoming,
                        Err(err) => {
                            error!(?err, "switching receiver failed");
                            break;
                        }
                    };
                    let message = match Switching::decode(bytes) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(?err, ?peer, "failed to decode switching message");
                            self.metrics.failures.inc();
                            continue;
                        }
                    };
                    self.handle_switching(
                        &mut control_tx,
                        &mut switching_tx,
                        &mut aggregation_tx,
                        peer,
                        message,
                    ).await;
                },

                // Handle tree messages
                incoming = aggregation_rx.recv() => {
                    let (peer, bytes) = match incoming {
                        Ok(incoming) => incoming,
                        Err(err) => {
                            error!(?err, "aggregation receiver failed");
                            break;
                        }
                    };
                    let message = match Aggregation::decode(bytes) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(?err, ?peer, "failed to decode aggregation message");
                            self.metrics.failures.inc();
                            continue;
                        }
                    };
                    self.handle_aggregation(
                        &mut switching_tx,
                        &mut aggregation_tx,
                        peer,
                        message,
                    ).await;
                },
            }
        }
    }

    // ---------- Application requests ----------

    fn handle_create(
        &mut self,
        survey_id: SurveyId,
        roster: Vec<P>,
        description: SurveyDescription,
    ) -> Result<(), Error> {
        if self.surveys.contains_key(&survey_id) {
            return Err(Error::SurveyExists(survey_id));
        }
        let roster = Roster::new(roster)?;
        if !roster.contains(&self.public_key) {
            return Err(Error::NotInRoster);
        }

        // The per-survey secret: generated here, never leaves this server.
        let secret = Scalar::from_rand(&mut self.context);
        self.surveys.insert(
            survey_id,
            Survey {
                roster,
                secret,
                store: Store::new(description),
            },
        );
        self.metrics.surveys.inc();
        info!(survey = %survey_id, "created survey");
        Ok(())
    }

    fn handle_submit(&mut self, survey_id: SurveyId, response: ClientResponse) -> Result<(), Error> {
        let survey = self
            .surveys
            .get_mut(&survey_id)
            .ok_or(Error::UnknownSurvey(survey_id))?;
        survey.store.insert_client_response(response)?;
        self.metrics.responses.inc();
        Ok(())
    }

    async fn handle_results(
        &mut self,
        control: &mut impl Sender<PublicKey = P>,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        survey_id: SurveyId,
        querier: G1,
        responder: oneshot::Sender<Result<Vec<SurveyResult>, Error>>,
    ) {
        // Validate the request synchronously.
        let Some(survey) = self.surveys.get(&survey_id) else {
            let _ = responder.send(Err(Error::UnknownSurvey(survey_id)));
            return;
        };
        if survey.roster.coordinator() != &self.public_key {
            let _ = responder.send(Err(Error::NotCoordinator));
            return;
        }
        if self.queries.contains_key(&survey_id) {
            let _ = responder.send(Err(Error::QueryInProgress(survey_id)));
            return;
        }

        info!(survey = %survey_id, "starting results query");
        self.metrics.pipelines.inc();

        // Ask every other member to label its own collected rows.
        let others: Vec<P> = survey
            .roster
            .members()
            .iter()
            .filter(|member| *member != &self.public_key)
            .cloned()
            .collect();
        let mut outstanding: HashSet<P> = HashSet::new();
        if !others.is_empty() {
            let message = Control::Flush { survey: survey_id };
            match send(control, Recipients::Some(others.clone()), &message, self.priority).await {
                Ok(sent) if sent.len() == others.len() => outstanding.extend(others),
                _ => {
                    let _ = responder.send(Err(Error::UnableToSendMessage));
                    self.metrics.failures.inc();
                    self.metrics.pipelines.dec();
                    return;
                }
            }
        }

        self.queries.insert(
            survey_id,
            Query {
                querier,
                responder,
                stage: Stage::Grouping { outstanding },
            },
        );

        // Label this server's own rows.
        match self.start_grouping(switching, survey_id).await {
            Ok(true) => {
                let me = self.public_key.clone();
                self.grouping_done(switching, aggregation, survey_id, &me).await;
            }
            Ok(false) => {
                // Our ring is in flight; completion arrives on the switching
                // channel.
                if let Some(query) = self.queries.get_mut(&survey_id) {
                    if let Stage::Grouping { outstanding } = &mut query.stage {
                        outstanding.insert(self.public_key.clone());
                    }
                }
            }
            Err(err) => self.fail_query(survey_id, err),
        }
    }

    // ---------- Grouping ----------

    /// Drains this server's collected rows and starts a deterministic
    /// switching instance over them, rooted here. Returns `Ok(true)` if the
    /// labels were pushed synchronously (no rows, or a singleton cothority).
    async fn start_grouping(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        survey_id: SurveyId,
    ) -> Result<bool, Error> {
        let survey = self
            .surveys
            .get_mut(&survey_id)
            .ok_or(Error::UnknownSurvey(survey_id))?;
        let data = survey
            .store
            .poll_probabilistic_grouping_attributes(&mut self.context)?;

        if data.is_empty() {
            survey
                .store
                .push_deterministic_grouping_attributes(HashMap::new())?;
            debug!(survey = %survey_id, "no rows to group");
            return Ok(true);
        }
        if survey.roster.len() == 1 {
            let labels = Self::label(data, &self.share, &survey.secret);
            survey.store.push_deterministic_grouping_attributes(labels)?;
            debug!(survey = %survey_id, "completed deterministic switching");
            return Ok(true);
        }

        let successor = survey
            .roster
            .successor(&self.public_key)
            .expect("member of roster")
            .clone();
        let message = Switching::Deterministic(DeterministicSwitched {
            survey: survey_id,
            initiator: self.public_key.clone(),
            data,
        });
        debug!(survey = %survey_id, "started deterministic switching");
        let sent = send(switching, Recipients::One(successor), &message, self.priority).await?;
        if sent.is_empty() {
            return Err(Error::UnableToSendMessage);
        }
        Ok(false)
    }

    /// Applies one member's deterministic partial and extracts the labels.
    fn label(
        data: HashMap<RowId, CipherVector>,
        share: &Scalar,
        secret: &Scalar,
    ) -> HashMap<RowId, GroupingAttributes> {
        data.into_iter()
            .map(|(id, mut vector)| {
                vector.switch_to_deterministic(share, secret);
                (id, vector.finalize_deterministic().into())
            })
            .collect()
    }

    /// Marks one member's grouping as complete and advances the pipeline
    /// once every member has reported.
    async fn grouping_done(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        survey_id: SurveyId,
        member: &P,
    ) {
        let Some(query) = self.queries.get_mut(&survey_id) else {
            return;
        };
        let Stage::Grouping { outstanding } = &mut query.stage else {
            warn!(survey = %survey_id, "unexpected grouping completion");
            return;
        };
        outstanding.remove(member);
        if !outstanding.is_empty() {
            return;
        }
        self.advance_to_aggregation(switching, aggregation, survey_id)
            .await;
    }

    // ---------- Aggregation ----------

    /// Starts the private aggregation instance rooted at this server.
    async fn advance_to_aggregation(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        survey_id: SurveyId,
    ) {
        if self.query_canceled(survey_id) {
            return;
        }
        let survey = self.surveys.get_mut(&survey_id).expect("query has survey");
        let local = survey.store.poll_locally_aggregated_responses();
        let children = survey.roster.children(&self.public_key);

        if children.is_empty() {
            self.finish_aggregation(switching, survey_id, local).await;
            return;
        }

        debug!(survey = %survey_id, "started private aggregation");
        self.queries
            .get_mut(&survey_id)
            .expect("query validated above")
            .stage = Stage::Aggregating;
        self.folds.insert(
            survey_id,
            Fold {
                accumulator: local,
                outstanding: children.iter().cloned().collect(),
            },
        );
        let message = Aggregation::Reference(DataReference { survey: survey_id });
        match send(
            aggregation,
            Recipients::Some(children.clone()),
            &message,
            self.priority,
        )
        .await
        {
            Ok(sent) if sent.len() == children.len() => {}
            _ => self.fail_query(survey_id, Error::UnableToSendMessage),
        }
    }

    /// Consumes the cothority-wide sums and starts the two final switching
    /// rings: the group labels to the querier key probabilistically, the
    /// aggregate sums through key switching.
    async fn finish_aggregation(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        survey_id: SurveyId,
        totals: HashMap<GroupingAttributes, CipherVector>,
    ) {
        if self.query_canceled(survey_id) {
            return;
        }
        debug!(survey = %survey_id, groups = totals.len(), "completed aggregation");
        let querier = self.queries.get(&survey_id).expect("query has survey").querier;
        let survey = self.surveys.get_mut(&survey_id).expect("query has survey");
        if let Err(err) = survey.store.push_cothority_aggregated_groups(totals) {
            self.fail_query(survey_id, err);
            return;
        }
        let (groups, aggregates) = match survey
            .store
            .poll_cothority_aggregated_groups(&mut self.context)
        {
            Ok(polled) => polled,
            Err(err) => {
                self.fail_query(survey_id, err);
                return;
            }
        };

        // Nothing was collected anywhere: deliver the empty result set.
        if groups.is_empty() {
            let result = survey
                .store
                .push_querier_key_encrypted_data(HashMap::new(), HashMap::new())
                .and_then(|_| survey.store.poll_deliverable_results());
            match result {
                Ok(results) => self.complete_query(survey_id, results),
                Err(err) => self.fail_query(survey_id, err),
            }
            return;
        }

        // Capture the original ephemeral keys, then zero the working copies.
        let originals: HashMap<RowId, Vec<G1>> = aggregates
            .iter()
            .map(|(id, vector)| (*id, vector.ephemeral_keys()))
            .collect();
        let mut working = aggregates;
        for vector in working.values_mut() {
            vector.clear_ephemeral_keys();
        }

        // Seed the group labels as trivial encryptions.
        let mut seeded: HashMap<RowId, CipherVector> = groups
            .into_iter()
            .map(|(id, deterministic)| (id, deterministic.seed_probabilistic()))
            .collect();

        if survey.roster.len() == 1 {
            // Singleton cothority: apply our partials and deliver.
            for (id, vector) in working.iter_mut() {
                if let Err(err) =
                    vector.switch_for_key(&self.share, &originals[id], &querier, &mut self.context)
                {
                    self.fail_query(survey_id, err);
                    return;
                }
            }
            for vector in seeded.values_mut() {
                vector.switch_to_probabilistic(&survey.secret, &querier, &mut self.context);
            }
            let result = survey
                .store
                .push_querier_key_encrypted_data(seeded, working)
                .and_then(|_| survey.store.poll_deliverable_results());
            match result {
                Ok(results) => self.complete_query(survey_id, results),
                Err(err) => self.fail_query(survey_id, err),
            }
            return;
        }

        self.queries
            .get_mut(&survey_id)
            .expect("query validated above")
            .stage = Stage::Switching {
            groups: None,
            aggregates: None,
        };

        let successor = self
            .surveys
            .get(&survey_id)
            .expect("query has survey")
            .roster
            .successor(&self.public_key)
            .expect("member of roster")
            .clone();
        debug!(survey = %survey_id, "started key switching");
        let key_message = Switching::KeySwitched(KeySwitchedCipher {
            survey: survey_id,
            initiator: self.public_key.clone(),
            data: working,
            new_key: querier,
            original_ephemeral_keys: originals,
        });
        debug!(survey = %survey_id, "started probabilistic switching");
        let probabilistic_message = Switching::Probabilistic(ProbabilisticSwitched {
            survey: survey_id,
            initiator: self.public_key.clone(),
            target_key: querier,
            data: seeded,
        });
        for message in [key_message, probabilistic_message] {
            match send(
                switching,
                Recipients::One(successor.clone()),
                &message,
                self.priority,
            )
            .await
            {
                Ok(sent) if !sent.is_empty() => {}
                _ => {
                    self.fail_query(survey_id, Error::UnableToSendMessage);
                    return;
                }
            }
        }
    }

    // ---------- Control channel ----------

    async fn handle_control(
        &mut self,
        control: &mut impl Sender<PublicKey = P>,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        peer: P,
        message: Control,
    ) {
        match message {
            Control::Flush { survey: survey_id } => {
                {
                    let Some(survey) = self.surveys.get(&survey_id) else {
                        warn!(survey = %survey_id, ?peer, "flush for unknown survey");
                        return;
                    };
                    if survey.roster.coordinator() != &peer {
                        warn!(survey = %survey_id, ?peer, "flush from non-coordinator");
                        return;
                    }
                }
                match self.start_grouping(switching, survey_id).await {
                    Ok(true) => {
                        // Nothing in flight: acknowledge immediately.
                        let ack = Control::FlushAck { survey: survey_id };
                        if send(control, Recipients::One(peer), &ack, self.priority)
                            .await
                            .map(|sent| sent.is_empty())
                            .unwrap_or(true)
                        {
                            error!(survey = %survey_id, "failed to send flush ack");
                            self.metrics.failures.inc();
                        }
                    }
                    Ok(false) => {
                        // Acknowledged once our ring instance terminates.
                    }
                    Err(err) => {
                        error!(?err, survey = %survey_id, "failed to start grouping");
                        self.metrics.failures.inc();
                    }
                }
            }
            Control::FlushAck { survey: survey_id } => {
                let expected = match self.queries.get(&survey_id) {
                    Some(Query {
                        stage: Stage::Grouping { outstanding },
                        ..
                    }) => outstanding.contains(&peer),
                    _ => false,
                };
                if !expected {
                    warn!(survey = %survey_id, ?peer, "unexpected flush ack");
                    return;
                }
                self.grouping_done(switching, aggregation, survey_id, &peer)
                    .await;
            }
        }
    }

    // ---------- Switching channel ----------

    async fn handle_switching(
        &mut self,
        control: &mut impl Sender<PublicKey = P>,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        peer: P,
        message: Switching<P>,
    ) {
        // The sender must be our ring predecessor for the survey, and the
        // initiator a roster member.
        let (survey_id, initiator) = match &message {
            Switching::Deterministic(message) => (message.survey, &message.initiator),
            Switching::Probabilistic(message) => (message.survey, &message.initiator),
            Switching::KeySwitched(message) => (message.survey, &message.initiator),
        };
        {
            let Some(survey) = self.surveys.get(&survey_id) else {
                warn!(survey = %survey_id, ?peer, "switching message for unknown survey");
                return;
            };
            if survey.roster.successor(&peer) != Some(&self.public_key) {
                warn!(survey = %survey_id, ?peer, "switching message from non-predecessor");
                return;
            }
            if !survey.roster.contains(initiator) {
                warn!(survey = %survey_id, ?peer, "switching message from unknown initiator");
                return;
            }
        }
        self.metrics.hops.inc();

        match message {
            Switching::Deterministic(message) => {
                self.handle_deterministic(control, switching, aggregation, message)
                    .await;
            }
            Switching::Probabilistic(message) => {
                self.handle_probabilistic(switching, message).await;
            }
            Switching::KeySwitched(message) => {
                self.handle_key_switched(switching, message).await;
            }
        }
    }

    async fn handle_deterministic(
        &mut self,
        control: &mut impl Sender<PublicKey = P>,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        mut message: DeterministicSwitched<P>,
    ) {
        let survey_id = message.survey;
        let survey = self.surveys.get_mut(&survey_id).expect("validated");

        // Apply our partial. Every member, the initiator included, applies
        // exactly once: the seed leaves the initiator untransformed.
        for vector in message.data.values_mut() {
            vector.switch_to_deterministic(&self.share, &survey.secret);
        }

        if message.initiator != self.public_key {
            // Carry on around the ring.
            let successor = survey
                .roster
                .successor(&self.public_key)
                .expect("member of roster")
                .clone();
            debug!(survey = %survey_id, "carried on deterministic switching");
            let forwarded = Switching::Deterministic(message);
            if send(switching, Recipients::One(successor), &forwarded, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to forward deterministic switching");
                self.metrics.failures.inc();
            }
            return;
        }

        // Terminal: the ring closed on us.
        debug!(survey = %survey_id, "completed deterministic switching");
        let labels = message
            .data
            .into_iter()
            .map(|(id, vector)| (id, vector.finalize_deterministic().into()))
            .collect();
        let is_coordinator = survey.roster.coordinator() == &self.public_key;

        if is_coordinator {
            let expected = matches!(
                self.queries.get(&survey_id),
                Some(Query {
                    stage: Stage::Grouping { .. },
                    ..
                })
            );
            if !expected {
                warn!(survey = %survey_id, "deterministic switching without active query");
                return;
            }
            let survey = self.surveys.get_mut(&survey_id).expect("validated");
            if let Err(err) = survey.store.push_deterministic_grouping_attributes(labels) {
                self.fail_query(survey_id, err);
                return;
            }
            let me = self.public_key.clone();
            self.grouping_done(switching, aggregation, survey_id, &me)
                .await;
        } else {
            if let Err(err) = survey.store.push_deterministic_grouping_attributes(labels) {
                error!(?err, survey = %survey_id, "failed to push deterministic labels");
                self.metrics.failures.inc();
                return;
            }
            let coordinator = survey.roster.coordinator().clone();
            let ack = Control::FlushAck { survey: survey_id };
            if send(control, Recipients::One(coordinator), &ack, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to send flush ack");
                self.metrics.failures.inc();
            }
        }
    }

    async fn handle_probabilistic(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        mut message: ProbabilisticSwitched<P>,
    ) {
        let survey_id = message.survey;
        let survey = self.surveys.get(&survey_id).expect("validated");

        for vector in message.data.values_mut() {
            vector.switch_to_probabilistic(&survey.secret, &message.target_key, &mut self.context);
        }

        if message.initiator != self.public_key {
            let successor = survey
                .roster
                .successor(&self.public_key)
                .expect("member of roster")
                .clone();
            debug!(survey = %survey_id, "carried on probabilistic switching");
            let forwarded = Switching::Probabilistic(message);
            if send(switching, Recipients::One(successor), &forwarded, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to forward probabilistic switching");
                self.metrics.failures.inc();
            }
            return;
        }

        debug!(survey = %survey_id, "completed probabilistic switching");
        match self.queries.get_mut(&survey_id) {
            Some(Query {
                stage: Stage::Switching { groups, .. },
                ..
            }) => {
                *groups = Some(message.data);
            }
            _ => {
                warn!(survey = %survey_id, "probabilistic switching without active query");
                return;
            }
        }
        self.try_deliver(survey_id);
    }

    async fn handle_key_switched(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        mut message: KeySwitchedCipher<P>,
    ) {
        let survey_id = message.survey;

        // Every component is switched against its original ephemeral key, as
        // captured by the initiator before the first hop.
        for (id, vector) in message.data.iter_mut() {
            let Some(originals) = message.original_ephemeral_keys.get(id) else {
                error!(survey = %survey_id, row = %id, "missing original ephemeral keys");
                self.metrics.failures.inc();
                if message.initiator == self.public_key {
                    self.fail_query(survey_id, Error::UnknownRow(*id));
                }
                return;
            };
            if let Err(err) =
                vector.switch_for_key(&self.share, originals, &message.new_key, &mut self.context)
            {
                error!(?err, survey = %survey_id, row = %id, "failed to key switch row");
                self.metrics.failures.inc();
                if message.initiator == self.public_key {
                    self.fail_query(survey_id, err);
                }
                return;
            }
        }

        if message.initiator != self.public_key {
            let survey = self.surveys.get(&survey_id).expect("validated");
            let successor = survey
                .roster
                .successor(&self.public_key)
                .expect("member of roster")
                .clone();
            debug!(survey = %survey_id, "carried on key switching");
            let forwarded = Switching::KeySwitched(message);
            if send(switching, Recipients::One(successor), &forwarded, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to forward key switching");
                self.metrics.failures.inc();
            }
            return;
        }

        debug!(survey = %survey_id, "completed key switching");
        match self.queries.get_mut(&survey_id) {
            Some(Query {
                stage: Stage::Switching { aggregates, .. },
                ..
            }) => {
                *aggregates = Some(message.data);
            }
            _ => {
                warn!(survey = %survey_id, "key switching without active query");
                return;
            }
        }
        self.try_deliver(survey_id);
    }

    /// Joins the two switching outputs and delivers the results once both
    /// rings have closed.
    fn try_deliver(&mut self, survey_id: SurveyId) {
        let ready = match self.queries.get_mut(&survey_id) {
            Some(Query {
                stage: Stage::Switching { groups, aggregates },
                ..
            }) if groups.is_some() && aggregates.is_some() => {
                Some((groups.take().unwrap(), aggregates.take().unwrap()))
            }
            _ => None,
        };
        let Some((groups, aggregates)) = ready else {
            return;
        };

        let survey = self.surveys.get_mut(&survey_id).expect("query has survey");
        let result = survey
            .store
            .push_querier_key_encrypted_data(groups, aggregates)
            .and_then(|_| survey.store.poll_deliverable_results());
        match result {
            Ok(results) => self.complete_query(survey_id, results),
            Err(err) => self.fail_query(survey_id, err),
        }
    }

    // ---------- Aggregation channel ----------

    async fn handle_aggregation(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        peer: P,
        message: Aggregation,
    ) {
        match message {
            Aggregation::Reference(message) => {
                self.handle_reference(aggregation, peer, message).await;
            }
            Aggregation::Child(message) => {
                self.handle_contribution(switching, aggregation, peer, message)
                    .await;
            }
        }
    }

    async fn handle_reference(
        &mut self,
        aggregation: &mut impl Sender<PublicKey = P>,
        peer: P,
        message: DataReference,
    ) {
        let survey_id = message.survey;
        let Some(survey) = self.surveys.get_mut(&survey_id) else {
            warn!(survey = %survey_id, ?peer, "announcement for unknown survey");
            return;
        };
        if survey.roster.parent(&self.public_key) != Some(&peer) {
            warn!(survey = %survey_id, ?peer, "announcement from non-parent");
            return;
        }
        self.metrics.hops.inc();

        let children = survey.roster.children(&self.public_key);
        let local = survey.store.poll_locally_aggregated_responses();

        if children.is_empty() {
            // Leaf: contribute immediately.
            debug!(survey = %survey_id, "contributing local aggregates");
            let message = Aggregation::Child(ChildAggregatedData {
                survey: survey_id,
                child_data: local,
            });
            if send(aggregation, Recipients::One(peer), &message, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to send aggregation contribution");
                self.metrics.failures.inc();
            }
            return;
        }

        // Inner node: pass the announcement down and await the children.
        if self.folds.remove(&survey_id).is_some() {
            error!(survey = %survey_id, "duplicate aggregation announcement");
            self.metrics.failures.inc();
            return;
        }
        match send(
            aggregation,
            Recipients::Some(children.clone()),
            &Aggregation::Reference(message),
            self.priority,
        )
        .await
        {
            Ok(sent) if sent.len() == children.len() => {}
            _ => {
                error!(survey = %survey_id, "failed to forward aggregation announcement");
                self.metrics.failures.inc();
                return;
            }
        }
        self.folds.insert(
            survey_id,
            Fold {
                accumulator: local,
                outstanding: children.into_iter().collect(),
            },
        );
    }

    async fn handle_contribution(
        &mut self,
        switching: &mut impl Sender<PublicKey = P>,
        aggregation: &mut impl Sender<PublicKey = P>,
        peer: P,
        message: ChildAggregatedData,
    ) {
        let survey_id = message.survey;
        if !self.surveys.contains_key(&survey_id) {
            warn!(survey = %survey_id, ?peer, "contribution for unknown survey");
            return;
        }
        let Some(fold) = self.folds.get_mut(&survey_id) else {
            warn!(survey = %survey_id, ?peer, "contribution without active aggregation");
            return;
        };
        if !fold.outstanding.remove(&peer) {
            // A duplicate or unexpected child is fatal to the instance.
            error!(survey = %survey_id, ?peer, "unexpected aggregation contribution");
            self.folds.remove(&survey_id);
            if self.queries.contains_key(&survey_id) {
                self.fail_query(survey_id, Error::UnexpectedContribution);
            } else {
                self.metrics.failures.inc();
            }
            return;
        }
        self.metrics.hops.inc();

        // Fold the child's groups into ours: vector addition on collision.
        for (attributes, vector) in message.child_data {
            match fold.accumulator.get_mut(&attributes) {
                Some(sum) => {
                    if let Err(err) = sum.add(&vector) {
                        error!(?err, survey = %survey_id, ?peer, "failed to fold contribution");
                        self.folds.remove(&survey_id);
                        if self.queries.contains_key(&survey_id) {
                            self.fail_query(survey_id, err);
                        } else {
                            self.metrics.failures.inc();
                        }
                        return;
                    }
                }
                None => {
                    fold.accumulator.insert(attributes, vector);
                }
            }
        }
        if !fold.outstanding.is_empty() {
            return;
        }

        // All children reported: either deliver (root) or pass upward.
        let fold = self.folds.remove(&survey_id).expect("fold checked above");
        let survey = self.surveys.get(&survey_id).expect("validated");
        if survey.roster.coordinator() == &self.public_key {
            let expected = matches!(
                self.queries.get(&survey_id),
                Some(Query {
                    stage: Stage::Aggregating,
                    ..
                })
            );
            if !expected {
                warn!(survey = %survey_id, "aggregation completion without active query");
                return;
            }
            self.finish_aggregation(switching, survey_id, fold.accumulator)
                .await;
        } else {
            let parent = survey
                .roster
                .parent(&self.public_key)
                .expect("inner node has parent")
                .clone();
            debug!(survey = %survey_id, "passing aggregates to parent");
            let message = Aggregation::Child(ChildAggregatedData {
                survey: survey_id,
                child_data: fold.accumulator,
            });
            if send(aggregation, Recipients::One(parent), &message, self.priority)
                .await
                .map(|sent| sent.is_empty())
                .unwrap_or(true)
            {
                error!(survey = %survey_id, "failed to send aggregation contribution");
                self.metrics.failures.inc();
            }
        }
    }

    // ---------- Query lifecycle ----------

    /// Detects a dropped responder: the querier gave up, so the pipeline
    /// stops without emitting further messages.
    fn query_canceled(&mut self, survey_id: SurveyId) -> bool {
        let canceled = match self.queries.get(&survey_id) {
            Some(query) => query.responder.is_canceled(),
            None => true,
        };
        if canceled {
            debug!(survey = %survey_id, "query canceled");
            self.queries.remove(&survey_id);
            self.folds.remove(&survey_id);
            self.metrics.pipelines.dec();
        }
        canceled
    }

    fn complete_query(&mut self, survey_id: SurveyId, results: Vec<SurveyResult>) {
        let Some(query) = self.queries.remove(&survey_id) else {
            return;
        };
        info!(survey = %survey_id, groups = results.len(), "completed results query");
        self.metrics.queries.inc();
        self.metrics.pipelines.dec();
        let _ = query.responder.send(Ok(results));
    }

    fn fail_query(&mut self, survey_id: SurveyId, err: Error) {
        let Some(query) = self.queries.remove(&survey_id) else {
            return;
        };
        warn!(?err, survey = %survey_id, "results query failed");
        self.folds.remove(&survey_id);
        self.metrics.failures.inc();
        self.metrics.pipelines.dec();
        let _ = query.responder.send(Err(err));
    }
}
