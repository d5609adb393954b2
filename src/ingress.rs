//! Application-facing mailbox for the [Engine](crate::Engine).

use commonware_cryptography::{bls12381::primitives::group::G1, PublicKey};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

use crate::types::{ClientResponse, SurveyDescription, SurveyId, SurveyResult};
use crate::Error;

/// Message types that can be sent to the `Mailbox`.
pub enum Message<P: PublicKey> {
    /// Create a survey over the given roster on this server.
    Create {
        survey: SurveyId,
        roster: Vec<P>,
        description: SurveyDescription,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Record an encrypted client row for a survey.
    Submit {
        survey: SurveyId,
        response: ClientResponse,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Run the survey pipeline and return the results re-encrypted under the
    /// querier's public key. Only the survey coordinator serves this request.
    Results {
        survey: SurveyId,
        querier: G1,
        responder: oneshot::Sender<Result<Vec<SurveyResult>, Error>>,
    },
}

/// Ingress mailbox for the [Engine](crate::Engine).
#[derive(Clone)]
pub struct Mailbox<P: PublicKey> {
    sender: mpsc::Sender<Message<P>>,
}

impl<P: PublicKey> Mailbox<P> {
    pub(crate) fn new(sender: mpsc::Sender<Message<P>>) -> Self {
        Self { sender }
    }

    /// Creates a survey on this server. Every roster member must be asked to
    /// create the same survey before rows are submitted or results requested.
    pub async fn create_survey(
        &mut self,
        survey: SurveyId,
        roster: Vec<P>,
        description: SurveyDescription,
    ) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Create {
                survey,
                roster,
                description,
                responder,
            })
            .await
            .expect("mailbox closed");
        receiver.await.map_err(Error::Canceled)?
    }

    /// Records an encrypted client row for a survey on this server.
    pub async fn submit_response(
        &mut self,
        survey: SurveyId,
        response: ClientResponse,
    ) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Submit {
                survey,
                response,
                responder,
            })
            .await
            .expect("mailbox closed");
        receiver.await.map_err(Error::Canceled)?
    }

    /// Runs the survey pipeline and returns the per-group results under the
    /// querier key. Dropping the returned future aborts the query.
    pub async fn survey_results(
        &mut self,
        survey: SurveyId,
        querier: G1,
    ) -> Result<Vec<SurveyResult>, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Results {
                survey,
                querier,
                responder,
            })
            .await
            .expect("mailbox closed");
        receiver.await.map_err(Error::Canceled)?
    }
}
