pub mod p4info;
pub mod p4runtime;
pub mod rules;
pub mod session;
pub mod supervisor;
pub mod topology;
