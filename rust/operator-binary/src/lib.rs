//! vcluster plugin that syncs cert-manager objects between the virtual and the host cluster.

pub mod constants;
pub mod controller;
pub mod external_crd;
pub mod hooks;
pub mod ingress;
pub mod patcher;
pub mod plane;
pub mod rewrite;
pub mod syncer;
pub mod translate;
pub mod utils;

use const_format::concatcp;

pub const APP_NAME: &str = "cert-manager-plugin";
pub const FIELD_MANAGER: &str = concatcp!(APP_NAME, ".vcluster.loft.sh");
