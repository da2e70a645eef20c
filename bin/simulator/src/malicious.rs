//! A hostile peer injecting frames straight into the relay.
//!
//! Eve attempts each attack against Bob and checks that his engine drops the
//! frame at the gateway or rejects the action in the reducer.
//!
//! Attack categories:
//! - **Signature attacks**: tampered bytes, forged authorship
//! - **Framing attacks**: garbage payloads, messages on the wrong topic
//! - **Timestamp attacks**: far-future timestamps
//! - **Permission attacks**: moderation by a non-admin

use crate::simulation::BoxError;
use cellsync::crypto::KeyPair;
use cellsync::dag::{current_timestamp_millis, ContentHash};
use cellsync::forum::{
    CellCreate, MessageKind, Moderate, ModerationAction, ModerationTarget, Payload, PostCreate,
    SignedMessage,
};
use cellsync::sync::{EngineHandle, SyncStatus};
use cellsync::transport::{topic_for, Frame, MemoryRelay};
use std::time::Duration;
use tracing::{debug, info};

/// Time given to the victim to process an injected frame.
const SETTLE: Duration = Duration::from_millis(300);

/// Names of every attack, in the order they are cycled.
pub fn all_attacks() -> Vec<&'static str> {
    vec![
        "tampered_signature",
        "forged_author",
        "garbage_frame",
        "wrong_topic",
        "future_timestamp",
        "unauthorized_moderation",
    ]
}

/// The attacker and what it aims at.
pub struct Attacker {
    keypair: KeyPair,
    relay: MemoryRelay,
    topic_prefix: String,
    victim: EngineHandle,
    cell_id: ContentHash,
}

impl Attacker {
    pub fn new(
        relay: MemoryRelay,
        topic_prefix: String,
        victim: EngineHandle,
        cell_id: ContentHash,
    ) -> Result<Self, BoxError> {
        Ok(Self {
            keypair: KeyPair::generate_ed25519()?,
            relay,
            topic_prefix,
            victim,
            cell_id,
        })
    }

    fn sign(&self, payload: Payload, timestamp: u64) -> Result<SignedMessage, BoxError> {
        Ok(SignedMessage::create(
            payload,
            timestamp,
            &self.keypair,
            None,
        )?)
    }

    fn inject(&self, kind: MessageKind, payload: Vec<u8>) -> Result<(), BoxError> {
        self.relay.inject(Frame {
            topic: topic_for(&self.topic_prefix, kind),
            payload,
        })?;
        Ok(())
    }

    fn inject_message(&self, message: &SignedMessage) -> Result<(), BoxError> {
        self.inject(message.kind(), message.to_frame()?)
    }

    fn status(&self) -> SyncStatus {
        *self.victim.status().borrow()
    }

    /// Executes one attack and returns whether it was blocked.
    pub async fn execute(&self, attack: &str) -> Result<bool, BoxError> {
        let before = self.status();
        let check = match attack {
            "tampered_signature" => self.tampered_signature()?,
            "forged_author" => self.forged_author()?,
            "garbage_frame" => self.garbage_frame()?,
            "wrong_topic" => self.wrong_topic()?,
            "future_timestamp" => self.future_timestamp()?,
            "unauthorized_moderation" => self.unauthorized_moderation()?,
            other => return Err(format!("Unknown attack: {}", other).into()),
        };
        tokio::time::sleep(SETTLE).await;

        let after = self.status();
        let state = self.victim.snapshot();
        let blocked = match check {
            Check::Dropped(id) => {
                after.dropped_frames > before.dropped_frames
                    && id.map_or(true, |id| !state.is_applied(&id))
            }
            Check::Rejected(target) => {
                after.rejected_actions > before.rejected_actions
                    && !state.moderation_status(&target).is_moderated()
            }
        };
        debug!(attack, blocked, "Attack evaluated");
        Ok(blocked)
    }

    fn tampered_signature(&self) -> Result<Check, BoxError> {
        let message = self.sign(
            CellCreate::new("evil".into(), "Tampered".into(), None)?.into(),
            current_timestamp_millis(),
        )?;
        let mut bytes = message.to_frame()?;
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        self.inject(MessageKind::CellCreate, bytes)?;
        Ok(Check::Dropped(Some(*message.id())))
    }

    /// Re-signs a message body under a key the claimed author never held.
    fn forged_author(&self) -> Result<Check, BoxError> {
        let victim_key = KeyPair::generate_ed25519()?;
        let honest = SignedMessage::create(
            PostCreate::new(self.cell_id, "Honest".into(), "Not really".into())?.into(),
            current_timestamp_millis(),
            &victim_key,
            None,
        )?;
        let forged = self.sign(
            PostCreate::new(self.cell_id, "Forged".into(), "Stolen identity".into())?.into(),
            honest.timestamp(),
        )?;
        let mut bytes = honest.to_frame()?;
        let forged_bytes = forged.to_frame()?;
        // Splice the forged tail (signature) onto the honest body.
        let tail = 64.min(bytes.len()).min(forged_bytes.len());
        let split = bytes.len() - tail;
        bytes[split..].copy_from_slice(&forged_bytes[forged_bytes.len() - tail..]);
        self.inject(MessageKind::PostCreate, bytes)?;
        Ok(Check::Dropped(Some(*honest.id())))
    }

    fn garbage_frame(&self) -> Result<Check, BoxError> {
        let bytes: Vec<u8> = (0..512).map(|_| rand::random::<u8>()).collect();
        self.inject(MessageKind::PostCreate, bytes)?;
        Ok(Check::Dropped(None))
    }

    fn wrong_topic(&self) -> Result<Check, BoxError> {
        let message = self.sign(
            PostCreate::new(self.cell_id, "Misfiled".into(), "On the vote topic".into())?.into(),
            current_timestamp_millis(),
        )?;
        self.inject(MessageKind::Vote, message.to_frame()?)?;
        Ok(Check::Dropped(Some(*message.id())))
    }

    fn future_timestamp(&self) -> Result<Check, BoxError> {
        let message = self.sign(
            PostCreate::new(self.cell_id, "From the future".into(), "Pinned forever".into())?
                .into(),
            current_timestamp_millis() + 24 * 60 * 60 * 1000,
        )?;
        self.inject_message(&message)?;
        Ok(Check::Dropped(Some(*message.id())))
    }

    fn unauthorized_moderation(&self) -> Result<Check, BoxError> {
        let state = self.victim.snapshot();
        let target = match state.posts_in_cell(&self.cell_id).first() {
            Some(post) => ModerationTarget::Post(post.id),
            None => ModerationTarget::User {
                cell_id: self.cell_id,
                address: cellsync::forum::Address::anonymous(self.keypair.public_key()),
            },
        };
        let message = self.sign(
            Moderate::new(target.clone(), ModerationAction::Moderate, "I say so".into())?.into(),
            current_timestamp_millis(),
        )?;
        self.inject_message(&message)?;
        Ok(Check::Rejected(target))
    }
}

enum Check {
    /// The gateway must drop the frame; the id must never apply.
    Dropped(Option<ContentHash>),
    /// The reducer must reject the action and leave the target untouched.
    Rejected(ModerationTarget),
}

/// Cycles through every attack until cancelled.
///
/// Panics if an attack gets through.
pub async fn run(attacker: Attacker) {
    info!("[Malicious] Eve will attempt various attacks against Bob...");
    let attacks = all_attacks();
    info!(
        "[Malicious] {} attack types available: {:?}",
        attacks.len(),
        attacks
    );

    for (i, attack) in attacks.iter().cycle().enumerate() {
        info!("[Malicious] Eve attempting attack #{}: {}", i + 1, attack);
        match attacker.execute(attack).await {
            Ok(true) => info!("[Malicious] Attack '{}' was correctly BLOCKED", attack),
            Ok(false) => panic!(
                "[SECURITY VULNERABILITY] Attack '{}' was NOT blocked!",
                attack
            ),
            Err(e) => info!(
                "[Malicious] Attack '{}' failed with error (expected): {}",
                attack, e
            ),
        }

        let delay_ms = {
            use rand::Rng;
            rand::thread_rng().gen_range(200..500u64)
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}
