mod common;
mod marshal;
mod session;
