pub const KERNEL_VERSION_STR: &str = "";
