//! The mesh-facing edge: a kube-backed entry client and event feed for
//! `networking.istio.io/v1alpha3 ServiceEntry` resources.

pub mod client;
pub mod convert;
pub mod feed;
pub mod namespace;
