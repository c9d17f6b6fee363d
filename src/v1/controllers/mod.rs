pub mod nodeselector;
pub mod plancontroller;
pub mod reconcile_error;
