pub mod affinity;
pub mod tcp;
