// Services module for the RKE2 automation backend
// Бизнес-логика: хранилище, лок, guardrails, оркестратор, раннер, шина

pub mod access_check_service;
pub mod analyzer_service;
pub mod encryption_service;
pub mod event_bus;
pub mod guardrails;
pub mod inventory_service;
pub mod lock_service;
pub mod orchestrator;
pub mod readiness_service;
pub mod runner_service;
pub mod status_service;
pub mod store;
