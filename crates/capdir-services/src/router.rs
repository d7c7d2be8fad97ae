//! Message router boundary.
//!
//! The directory does not route anything itself. It only tells the router
//! where providers learned from the backend can be reached, and forgets
//! them again when they are removed or expire.

pub trait MessageRouter: Send + Sync {
    fn add_next_hop(&self, participant_id: &str, address: &str, is_globally_visible: bool);
    fn remove_next_hop(&self, participant_id: &str);
}
