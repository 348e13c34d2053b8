use faceclock_core::{
    EnrollmentResult, FaceExtractor, FaceIdentityService, ServiceError, SignatureStore,
    VerificationOutcome,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests beyond this wait in the D-Bus handler.
const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity_key: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollmentResult, ServiceError>>,
    },
    Replace {
        identity_key: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollmentResult, ServiceError>>,
    },
    Verify {
        identity_key: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<VerificationOutcome, ServiceError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn enroll(
        &self,
        identity_key: String,
        image: Vec<u8>,
    ) -> Result<EnrollmentResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            identity_key,
            image,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn replace(
        &self,
        identity_key: String,
        image: Vec<u8>,
    ) -> Result<EnrollmentResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Replace {
            identity_key,
            image,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn verify(
        &self,
        identity_key: String,
        image: Vec<u8>,
    ) -> Result<VerificationOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Verify {
            identity_key,
            image,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the service, and with it the extractor, so model state is
/// never shared. Requests are handled one at a time in arrival order; the
/// thread exits when every handle has been dropped.
pub fn spawn_engine<E, S>(mut service: FaceIdentityService<E, S>) -> EngineHandle
where
    E: FaceExtractor + 'static,
    S: SignatureStore + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("faceclock-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        identity_key,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(service.enroll(&identity_key, &image));
                    }
                    EngineRequest::Replace {
                        identity_key,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(service.replace(&identity_key, &image));
                    }
                    EngineRequest::Verify {
                        identity_key,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(service.verify(&identity_key, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}
