pub mod coordinator;
pub mod dispatch;
pub mod endpoint;
pub mod files;
pub mod handler;
pub mod handlers;
pub mod node;
pub mod registry;
pub mod status;

pub use coordinator::{
    ChunkedTransferCoordinator, FetchError, PeerClient, RankedPeer, TransferError,
    TransferHandle, TransferStatus,
};
pub use dispatch::RequestDispatchTable;
pub use endpoint::{PeerConnectionEndpoint, Transport};
pub use files::{hash_file, ChunkWriter, ChunkedFile, DownloadableFiles, WriteError};
pub use handler::{HandlerError, RequestHandler};
pub use handlers::{standard_table, NodeInfo};
pub use node::NodeState;
pub use registry::{Admission, PeerDescriptor, PeerDirection, PeerRegistry};
pub use status::{TaskId, TaskRegistry, TaskReporter};
