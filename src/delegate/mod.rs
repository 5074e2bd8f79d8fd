//! Delegate enrollment windows and the per-round agreement protocol.

mod agreement;
mod enroll;

pub use agreement::{select_ballot, verify_proof, AgreementProof, DelegateAgreement};
pub use enroll::{select_enrolled, DelegateEnrolled};
