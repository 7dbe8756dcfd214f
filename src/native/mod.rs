/// Native module contains the sandbox implementation of core traits
/// without any container runtime like Docker or Runc,
/// using namespaces, rlimits, process groups and procfs directly instead.
pub mod capture;
pub mod launcher;
pub mod limits;
pub mod namespace;
pub mod process_tree;
pub mod sandbox;
pub mod workspace;
