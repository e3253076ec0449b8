//! Seams toward the host application.
//!
//! The engine never touches a sound card or a renderer itself. The embedding
//! application hands in an [`AudioPlayer`] for speech playback and,
//! optionally, an [`AvatarEngine`] for expression directives piggybacked on
//! audio frames.

use crate::playback::AudioPlayer;
use std::sync::Arc;

/// Receives avatar directives extracted from the reply stream.
pub trait AvatarEngine: Send + Sync {
    /// Applies an expression by its model-defined index.
    fn set_expression(&self, index: i64);
}

/// The host-supplied integration points.
#[derive(Clone)]
pub struct Collaborators {
    pub audio: Arc<dyn AudioPlayer>,
    pub avatar: Option<Arc<dyn AvatarEngine>>,
}

impl Collaborators {
    pub fn new(audio: Arc<dyn AudioPlayer>) -> Self {
        Self {
            audio,
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: Arc<dyn AvatarEngine>) -> Self {
        self.avatar = Some(avatar);
        self
    }
}
