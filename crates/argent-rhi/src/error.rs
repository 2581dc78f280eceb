use argent_hal::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A uniform-type combination the driver cannot express. Severity is
    /// decided at the call site: degrade to a logged no-op or fail hard.
    #[error("binding {binding} of set {set} is not representable: {reason}")]
    UnsupportedBinding {
        set: u32,
        binding: u32,
        reason: &'static str,
    },
}
