pub mod boot;
pub mod config;
pub mod error;
pub mod http;
pub mod pages;
pub mod platform;
pub mod provisioning;
pub mod retained;
pub mod router;
pub mod storage;
pub mod types;

pub use boot::BootClassifier;
pub use config::{BootConfig, ProbeConfig, ProvisioningConfig, RETAINED_MAGIC};
pub use error::{NetError, StoreError};
pub use http::{
    decode_form, HttpMethod, HttpRequest, HttpResponse, HttpServer, IncomingRequest, RequestId,
};
pub use platform::{AccessPointSettings, CaptiveDns, System, WifiRadio};
pub use provisioning::{NetworkServices, ProvisioningController};
pub use retained::{RetainedRegion, SharedRetained};
pub use router::{Router, Target};
pub use storage::{KeyValueStore, MemoryStore, StoredValue};
pub use types::{
    BootAction, BootState, NetworkCredentials, ProvisioningMode, ResetKind, RetainedBootMemory,
    TemperatureReport,
};
