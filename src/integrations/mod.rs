//! External collaborators behind narrow interfaces: transcription, letter
//! composition, PDF rendering, the print-and-mail provider, and payments.

pub mod compose;
pub mod mail;
pub mod payments;
pub mod pdf;
pub mod transcribe;
