//! Types of CRDs that are owned by other operators.

pub mod cert_manager;
