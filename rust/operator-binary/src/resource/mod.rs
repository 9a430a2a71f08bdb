pub mod pod;
pub mod pod_set;
pub mod pvc;
