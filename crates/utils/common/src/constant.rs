#[allow(non_upper_case_globals)]
pub const KiB: usize = 1024;
#[allow(non_upper_case_globals)]
pub const MiB: usize = 1024 * KiB;
#[allow(non_upper_case_globals)]
pub const GiB: usize = 1024 * MiB;
