pub mod signed_witness;

pub use signed_witness::SignedWitnessService;
