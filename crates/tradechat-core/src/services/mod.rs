pub mod backend;
pub mod error_collector_layer;
pub mod error_format;
pub mod http_backend;
pub mod protocol;
pub mod socket;
pub mod stream_assembler;

pub use backend::{ChatBackend, ChunkStream, DecisionReply, DecisionRequest, FallbackReply, MessageRequest};
pub use error_collector_layer::ErrorCollectorLayer;
pub use error_format::{GENERIC_ERROR_MESSAGE, TIMEOUT_MESSAGE, describe_error};
pub use http_backend::HttpChatBackend;
pub use protocol::{Chunk, ClientFrame, InboundFrame};
pub use socket::{PushChannel, SocketChannel};
pub use stream_assembler::{AssemblyStep, StreamAccumulator};
