// Local data file initialization
//
// Migrations are applied best-effort; see `migrations::initialize`.

pub mod migrations;
