pub mod logging;
pub mod path_resolver;
pub mod privilege;
pub mod validation;
