//! Outbound plumbing for the ingester: the storage-element data model and
//! the HTTP clients for elements, the admin service, and the service-account
//! token endpoint. Coordination logic lives in ficore.

pub mod admin;
pub mod auth;
pub mod element;
pub mod seclient;
