pub mod ingestion;
pub mod ingress;
