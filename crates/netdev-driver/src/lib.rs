//! Node-side driver handing host network devices to workloads.
//!
//! Claims are prepared through the [`domain::AllocationCoordinator`], sandbox
//! lifecycle hooks move devices in and out through the
//! [`domain::SandboxHookDispatcher`], and the node inventory is published as a
//! `ResourceSlice` by [`publisher`].

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod drivers;
pub mod kube_client;
pub mod lifecycle;
pub mod netns;
pub mod publisher;
pub mod service;
