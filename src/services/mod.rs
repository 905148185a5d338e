//! Server-side services: the storage gateway, the metadata store, chunk
//! staging, and the file service that coordinates them.

pub mod chunk_assembler;
pub mod file_service;
pub mod metadata_store;
pub mod storage_gateway;
