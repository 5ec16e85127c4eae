//! Platform primitives for CSI Node operations: iSCSI, filesystem
//! formatting, and mount/bind-mount, shelled out to Linux tools
//! (iscsiadm, mkfs.*, blkid, mount). The NVMe-oF attach state machine
//! lives in `node::nvme` instead of here, since it needs async
//! timeouts and retry budgets these blocking calls don't model.

pub mod linux;

use tonic::Status;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, Status>;
