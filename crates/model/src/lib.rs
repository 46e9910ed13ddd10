//! Multi-modal robot policy core.
//!
//! Modality embeddings are stacked per timestep with learned query tokens
//! ([`SequenceComposer`]), run through a causal backbone, and the query
//! outputs are decoded into action chunks, reconstructed image patches and a
//! value distribution ([`PredictionDecoder`]). [`TokenLayout`] is the single
//! record of where every segment sits inside a step.

pub mod backbone;
pub mod composer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod heads;
pub mod layout;
pub mod mask;
pub mod modality;
pub mod policy;
pub mod predictions;
pub mod query;

pub use backbone::{Backbone, Gpt2Backbone, IdentityBackbone};
pub use composer::{ComposedSequence, SequenceComposer};
pub use config::{BackboneConfig, DecoderConfig, ModelConfig, QuantileConfig};
pub use decoder::{query_spans, ActionHead, ForwardHead, PredictionDecoder, QuantileHead};
pub use error::{ModelError, Result};
pub use heads::{HeadSet, ObservationHeads, Routing};
pub use layout::{LayoutSpec, Segment, SegmentKind, TokenLayout};
pub use mask::AttentionMaskBuilder;
pub use modality::{Modality, ModalityEmbeddings};
pub use policy::PolicyModel;
pub use predictions::Predictions;
pub use query::{MaterializedQueries, QueryBank};
