/// Implementation details of the bitcoin-oracle library.
/// Not part of the public API.
pub(crate) mod wire;
