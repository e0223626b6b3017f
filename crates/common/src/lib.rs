// reviewbox-common: shared types for the reviewbox workspace

pub mod protocol;
