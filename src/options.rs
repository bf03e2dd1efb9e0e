/// Supplied to `DbBuilder::finalize`.
pub struct BuildOptions {
    /// Whether to learn a codebook over the unique values and store them
    /// compressed. When false, value bytes are written verbatim.
    pub compression: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { compression: true }
    }
}

impl BuildOptions {
    /// Options with codebook compression turned off.
    pub fn no_compression() -> BuildOptions {
        BuildOptions { compression: false }
    }
}
