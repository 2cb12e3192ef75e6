pub mod error;
pub mod framing;
pub mod ids;
pub mod reply;
pub mod request;
pub mod traits;

pub use error::{CryptoError, ValidationError};
pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use ids::{Did, NodeIdentity, NodeName, PayloadDigest, ReqId, SeqNo, Verkey};
pub use reply::{NodeReply, RejectKind, ReplyFrame};
pub use request::{
    Operation, OperationKind, Request, RequestClass, Role, SchemaData, SchemaKey,
};
pub use traits::{NodeSigner, ReplyVerifier, VerificationContext};
