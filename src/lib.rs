//! Privacy-preserving distributed aggregation of encrypted survey responses.
//!
//! # Overview
//!
//! A fixed roster of mutually distrusting servers (a cothority) jointly
//! processes encrypted survey rows without any single server being able to
//! decrypt an individual row. Clients submit rows of the form
//! `(grouping attributes, numeric aggregates)` encrypted under the
//! cothority's collective ElGamal key: the sum of every member's public key
//! share. A querier receives the per-group sums re-encrypted under its own
//! public key.
//!
//! Grouped aggregation is the composition of four cooperative protocols:
//!
//! - *Deterministic switching* (ring): converts probabilistically encrypted
//!   grouping attributes into survey-scoped deterministic labels, so equal
//!   plaintexts can be grouped without decryption.
//! - *Private aggregation* (tree): folds every member's locally aggregated
//!   groups up a binary tree, adding cipher vectors on group collision.
//! - *Key switching* (ring): re-encrypts the aggregate sums from the
//!   collective key to the querier key without decrypting.
//! - *Probabilistic switching* (ring): converts the deterministic group
//!   labels back into fresh encryptions under the querier key.
//!
//! Each member runs one [Engine]. Ring hops are stateless (apply the member's
//! partial transformation, forward to the ring successor); the initiator of
//! an instance recognizes termination when the message carries its own
//! identity. The survey coordinator (the roster head) drives the pipeline in
//! response to a results query: grouping on every collecting member, then
//! aggregation, then the two final switches in parallel.
//!
//! All protocols assume honest-but-curious members: everyone follows the
//! protocol, and correctness of the composite transformation requires every
//! member to participate exactly once per instance.

pub mod cipher;
mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::{Mailbox, Message};
mod metrics;
pub mod store;
pub mod topology;
pub mod types;
pub use types::{ClientResponse, Error, SurveyDescription, SurveyId, SurveyResult};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherVector, DecryptionTable};
    use commonware_cryptography::{
        bls12381::primitives::group::G1,
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt, Signer,
    };
    use commonware_macros::test_traced;
    use commonware_p2p::simulated::{Link, Network, Oracle, Receiver, Sender};
    use commonware_runtime::{deterministic, Metrics, Runner};
    use std::collections::HashMap;
    use std::time::Duration;

    const MAILBOX_SIZE: usize = 64;
    const CONTROL_CHANNEL: u32 = 0;
    const SWITCHING_CHANNEL: u32 = 1;
    const AGGREGATION_CHANNEL: u32 = 2;
    const LINK: Link = Link {
        latency: 10.0,
        jitter: 1.0,
        success_rate: 1.0,
    };

    type Channels = (
        (Sender<PublicKey>, Receiver<PublicKey>),
        (Sender<PublicKey>, Receiver<PublicKey>),
        (Sender<PublicKey>, Receiver<PublicKey>),
    );

    async fn setup_network(
        context: &deterministic::Context,
        peers: usize,
    ) -> (Vec<PublicKey>, Vec<Channels>, Oracle<PublicKey>) {
        let (network, mut oracle) = Network::new(
            context.with_label("network"),
            commonware_p2p::simulated::Config {
                max_size: 1024 * 1024,
            },
        );
        network.start();

        let peers: Vec<PublicKey> = (0..peers)
            .map(|seed| PrivateKey::from_seed(seed as u64).public_key())
            .collect();
        let mut registrations = Vec::new();
        for peer in &peers {
            let control = oracle.register(peer.clone(), CONTROL_CHANNEL).await.unwrap();
            let switching = oracle
                .register(peer.clone(), SWITCHING_CHANNEL)
                .await
                .unwrap();
            let aggregation = oracle
                .register(peer.clone(), AGGREGATION_CHANNEL)
                .await
                .unwrap();
            registrations.push((control, switching, aggregation));
        }
        for from in &peers {
            for to in &peers {
                if from == to {
                    continue;
                }
                oracle
                    .add_link(from.clone(), to.clone(), LINK.clone())
                    .await
                    .unwrap();
            }
        }
        (peers, registrations, oracle)
    }

    /// Spawns one engine per peer and returns the mailboxes along with the
    /// cothority's collective public key.
    fn spawn_cothority(
        context: &mut deterministic::Context,
        peers: &[PublicKey],
        registrations: Vec<Channels>,
    ) -> (Vec<Mailbox<PublicKey>>, G1) {
        let mut mailboxes = Vec::new();
        let mut publics = Vec::new();
        for (peer, (control, switching, aggregation)) in peers.iter().zip(registrations) {
            let (share, public) = cipher::keygen(context);
            publics.push(public);
            let (engine, mailbox) = Engine::new(
                context.with_label(&format!("engine_{peer}")),
                Config {
                    public_key: peer.clone(),
                    share,
                    mailbox_size: MAILBOX_SIZE,
                    priority: false,
                },
            );
            engine.start(control, switching, aggregation);
            mailboxes.push(mailbox);
        }
        (mailboxes, cipher::combine(&publics))
    }

    async fn create_everywhere(
        mailboxes: &mut [Mailbox<PublicKey>],
        survey: SurveyId,
        roster: &[PublicKey],
        description: SurveyDescription,
    ) {
        for mailbox in mailboxes.iter_mut() {
            mailbox
                .create_survey(survey, roster.to_vec(), description)
                .await
                .unwrap();
        }
    }

    #[test_traced]
    fn test_single_server_pipeline() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|mut context| async move {
            let (peers, registrations, _oracle) = setup_network(&context, 1).await;
            let (mut mailboxes, collective) =
                spawn_cothority(&mut context, &peers, registrations);

            let survey = SurveyId(1);
            let description = SurveyDescription {
                grouping_attributes: 1,
                aggregate_attributes: 3,
            };
            create_everywhere(&mut mailboxes, survey, &peers, description).await;

            mailboxes[0]
                .submit_response(
                    survey,
                    ClientResponse {
                        grouping: CipherVector::encrypt(&collective, &[1], &mut context),
                        aggregates: CipherVector::encrypt(&collective, &[3, 0, 0], &mut context),
                    },
                )
                .await
                .unwrap();

            let (querier_secret, querier_public) = cipher::keygen(&mut context);
            let results = mailboxes[0]
                .survey_results(survey, querier_public)
                .await
                .unwrap();

            let table = DecryptionTable::new(8);
            assert_eq!(results.len(), 1);
            assert_eq!(
                results[0].grouping.decrypt(&querier_secret, &table).unwrap(),
                vec![1]
            );
            assert_eq!(
                results[0]
                    .aggregates
                    .decrypt(&querier_secret, &table)
                    .unwrap(),
                vec![3, 0, 0]
            );
        });
    }

    #[test_traced]
    fn test_grouped_aggregation_across_servers() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|mut context| async move {
            let (peers, registrations, _oracle) = setup_network(&context, 5).await;
            let (mut mailboxes, collective) =
                spawn_cothority(&mut context, &peers, registrations);

            let survey = SurveyId(2);
            let description = SurveyDescription {
                grouping_attributes: 1,
                aggregate_attributes: 10,
            };
            create_everywhere(&mut mailboxes, survey, &peers, description).await;

            // Ten rows, grouped cyclically into four groups, submitted
            // round-robin across all five servers.
            let mut expected: HashMap<Vec<u32>, Vec<u32>> = HashMap::new();
            for row in 0..10u32 {
                let group = vec![row % 4];
                let mut aggregates = vec![0u32; 10];
                aggregates[row as usize] = 3;

                let sums = expected.entry(group.clone()).or_insert_with(|| vec![0; 10]);
                for (sum, value) in sums.iter_mut().zip(aggregates.iter()) {
                    *sum += value;
                }

                mailboxes[row as usize % 5]
                    .submit_response(
                        survey,
                        ClientResponse {
                            grouping: CipherVector::encrypt(&collective, &group, &mut context),
                            aggregates: CipherVector::encrypt(
                                &collective,
                                &aggregates,
                                &mut context,
                            ),
                        },
                    )
                    .await
                    .unwrap();
            }

            let (querier_secret, querier_public) = cipher::keygen(&mut context);
            let results = mailboxes[0]
                .survey_results(survey, querier_public)
                .await
                .unwrap();

            let table = DecryptionTable::new(16);
            assert_eq!(results.len(), expected.len());
            for result in results {
                let group = result.grouping.decrypt(&querier_secret, &table).unwrap();
                let sums = result.aggregates.decrypt(&querier_secret, &table).unwrap();
                assert_eq!(expected.remove(&group), Some(sums));
            }
            assert!(expected.is_empty());
        });
    }

    #[test_traced]
    fn test_identical_groups_merge() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|mut context| async move {
            let (peers, registrations, _oracle) = setup_network(&context, 3).await;
            let (mut mailboxes, collective) =
                spawn_cothority(&mut context, &peers, registrations);

            let survey = SurveyId(3);
            let description = SurveyDescription {
                grouping_attributes: 1,
                aggregate_attributes: 2,
            };
            create_everywhere(&mut mailboxes, survey, &peers, description).await;

            // Identical plaintext groupings under different encryptions,
            // collected by different servers, merge into one group.
            for (server, aggregates) in [(1usize, [1u32, 0]), (2, [0, 1])] {
                mailboxes[server]
                    .submit_response(
                        survey,
                        ClientResponse {
                            grouping: CipherVector::encrypt(&collective, &[7], &mut context),
                            aggregates: CipherVector::encrypt(
                                &collective,
                                &aggregates,
                                &mut context,
                            ),
                        },
                    )
                    .await
                    .unwrap();
            }

            let (querier_secret, querier_public) = cipher::keygen(&mut context);
            let results = mailboxes[0]
                .survey_results(survey, querier_public)
                .await
                .unwrap();

            let table = DecryptionTable::new(8);
            assert_eq!(results.len(), 1);
            assert_eq!(
                results[0].grouping.decrypt(&querier_secret, &table).unwrap(),
                vec![7]
            );
            assert_eq!(
                results[0]
                    .aggregates
                    .decrypt(&querier_secret, &table)
                    .unwrap(),
                vec![1, 1]
            );
        });
    }

    #[test_traced]
    fn test_repeated_query_drains_rows_once() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|mut context| async move {
            let (peers, registrations, _oracle) = setup_network(&context, 3).await;
            let (mut mailboxes, collective) =
                spawn_cothority(&mut context, &peers, registrations);

            let survey = SurveyId(4);
            let description = SurveyDescription {
                grouping_attributes: 1,
                aggregate_attributes: 1,
            };
            create_everywhere(&mut mailboxes, survey, &peers, description).await;

            mailboxes[1]
                .submit_response(
                    survey,
                    ClientResponse {
                        grouping: CipherVector::encrypt(&collective, &[2], &mut context),
                        aggregates: CipherVector::encrypt(&collective, &[5], &mut context),
                    },
                )
                .await
                .unwrap();

            let (querier_secret, querier_public) = cipher::keygen(&mut context);
            let results = mailboxes[0]
                .survey_results(survey, querier_public)
                .await
                .unwrap();
            let table = DecryptionTable::new(8);
            assert_eq!(results.len(), 1);
            assert_eq!(
                results[0]
                    .aggregates
                    .decrypt(&querier_secret, &table)
                    .unwrap(),
                vec![5]
            );

            // Every row flowed through the pipeline exactly once: a second
            // query over no new rows delivers nothing.
            let results = mailboxes[0]
                .survey_results(survey, querier_public)
                .await
                .unwrap();
            assert!(results.is_empty());
        });
    }

    #[test_traced]
    fn test_request_validation() {
        let executor = deterministic::Runner::timed(Duration::from_secs(30));
        executor.start(|mut context| async move {
            let (peers, registrations, _oracle) = setup_network(&context, 2).await;
            let (mut mailboxes, collective) =
                spawn_cothority(&mut context, &peers, registrations);

            let survey = SurveyId(5);
            let description = SurveyDescription {
                grouping_attributes: 1,
                aggregate_attributes: 2,
            };
            create_everywhere(&mut mailboxes, survey, &peers, description).await;

            // Creation is rejected for duplicates, empty rosters, and rosters
            // that exclude the server.
            assert!(matches!(
                mailboxes[0]
                    .create_survey(survey, peers.clone(), description)
                    .await,
                Err(Error::SurveyExists(_))
            ));
            assert!(matches!(
                mailboxes[0]
                    .create_survey(SurveyId(6), Vec::new(), description)
                    .await,
                Err(Error::EmptyRoster)
            ));
            assert!(matches!(
                mailboxes[0]
                    .create_survey(SurveyId(7), vec![peers[1].clone()], description)
                    .await,
                Err(Error::NotInRoster)
            ));

            // Submissions must match the survey description.
            assert!(matches!(
                mailboxes[0]
                    .submit_response(
                        survey,
                        ClientResponse {
                            grouping: CipherVector::encrypt(&collective, &[1, 2], &mut context),
                            aggregates: CipherVector::encrypt(&collective, &[0, 0], &mut context),
                        },
                    )
                    .await,
                Err(Error::InvalidDimensions { .. })
            ));
            assert!(matches!(
                mailboxes[0]
                    .submit_response(
                        SurveyId(8),
                        ClientResponse {
                            grouping: CipherVector::encrypt(&collective, &[1], &mut context),
                            aggregates: CipherVector::encrypt(&collective, &[0, 0], &mut context),
                        },
                    )
                    .await,
                Err(Error::UnknownSurvey(_))
            ));

            // Only the coordinator serves results.
            let (_, querier_public) = cipher::keygen(&mut context);
            assert!(matches!(
                mailboxes[1].survey_results(survey, querier_public).await,
                Err(Error::NotCoordinator)
            ));
            assert!(matches!(
                mailboxes[0]
                    .survey_results(SurveyId(9), querier_public)
                    .await,
                Err(Error::UnknownSurvey(_))
            ));
        });
    }
}
