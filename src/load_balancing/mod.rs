pub mod distributor;

pub use distributor::CallDistributor;
