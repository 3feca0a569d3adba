// Models module for the RKE2 automation backend
// Сущности хранилища и схемы API-запросов/ответов

pub mod cluster;
pub mod credential;
pub mod job;
pub mod node;
pub mod response;

pub use cluster::*;
pub use credential::*;
pub use job::*;
pub use node::*;
pub use response::*;
