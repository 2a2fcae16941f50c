mod test_controller;

pub mod utils;
