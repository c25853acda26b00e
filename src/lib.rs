// ABOUTME: Root library module for the switchboard gateway control plane.
// ABOUTME: Wires the agent seam, chat orchestration, providers, gateway, and reload driver.

pub mod agent;
pub mod browser;
pub mod chat;
pub mod cron;
pub mod gateway;
pub mod heartbeat;
pub mod hooks;
pub mod providers;
pub mod reload;
pub mod server;

pub use server::{GatewayCore, RestartReason};
