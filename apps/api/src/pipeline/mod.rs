// Video processing pipeline: status state machine, artifact contract, event
// dispatch, the chunk+embed stage handler and the stuck-video recovery sweep.
// Status/metadata writes go through `store::VideoStore` only.

pub mod contract;
pub mod events;
pub mod handlers;
pub mod recovery;
pub mod stages;
pub mod state_machine;
pub mod store;

#[cfg(test)]
pub mod test_support;
