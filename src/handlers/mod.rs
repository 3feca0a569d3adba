// Handlers module for the RKE2 automation backend

pub mod cluster_handler;
pub mod credential_handler;
pub mod health_handler;
pub mod job_handler;
