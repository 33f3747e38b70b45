//! Map state handed from one pipeline stage to the next.
//!
//! - [`VoState`] - landmarks (pixel + world point pairs) and the current pose
//! - [`CandidatePool`] - keypoints tracked until they can be triangulated
//!
//! Both are plain values: every stage takes them by value and returns the
//! updated version, so there is never more than one owner.
//!
//! # Example
//!
//! ```ignore
//! use mono_vo::map::{Candidate, CandidatePool, Landmark, VoState};
//!
//! let mut state = VoState::new(landmarks, pose);
//! let mut pool = CandidatePool::default();
//! pool.push(Candidate::new(pixel, state.pose, frame_index));
//!
//! // Promotion moves a candidate into the landmarks.
//! state.landmarks.push(Landmark::new(pixel, position));
//! ```

pub mod candidates;
pub mod state;

pub use candidates::{Candidate, CandidatePool};
pub use state::{Landmark, Landmarks, VoState};
