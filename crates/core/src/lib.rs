//! Manifold core types: records, typed references between them, the kind
//! registry and the content codec every other crate goes through.

#![forbid(unsafe_code)]

pub mod codec;
pub mod collection;
pub mod error;
pub mod event;
pub mod record;
pub mod reference;
pub mod registry;
pub mod settings;

pub use codec::{Content, ContentCodec, YamlCodec};
pub use collection::{Collection, EdgeDelta};
pub use error::{CoreError, CoreResult};
pub use event::SourceEvent;
pub use record::{Origin, Record, RecordId, RecordOverrides, Storage, DEFAULT_NAMESPACE};
pub use reference::{RefKind, RefStatus, RefTarget, Reference};
pub use registry::{KindInfo, KindRegistry, ANY_KIND};
pub use settings::Settings;

pub mod prelude {
    pub use super::{
        Collection, Content, ContentCodec, KindRegistry, Record, RecordId, RecordOverrides, RefKind, RefStatus,
        RefTarget, Reference, SourceEvent, Storage, YamlCodec,
    };
}
