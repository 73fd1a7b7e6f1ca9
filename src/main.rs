use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use expstore::config::Settings;
use expstore::database::Database;
use expstore::error::StoreError;

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn run(settings: &Settings) -> Result<(), StoreError> {
    let db = Database::open(settings.database_options())?;
    let mut created = 0;
    for declaration in settings.bootstrap_types()? {
        match db.experiment_type_by_name(&declaration.name) {
            Ok(_) => continue,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match db.create_experiment_type(&declaration) {
            Ok(experiment_type) => {
                created += 1;
                info!(name = %experiment_type.name, table = %experiment_type.table_name, "bootstrapped experiment type");
            }
            Err(e) if e.is_conflict() => {
                warn!(name = %declaration.name, error = %e, "skipped bootstrap declaration");
            }
            Err(e) => return Err(e),
        }
    }
    let types = db.experiment_types(0, Some(db.limits().max_page_size))?;
    info!(experiment_types = types.len(), bootstrapped = created, "store ready");
    for experiment_type in &types {
        info!(
            name = %experiment_type.name,
            table = %experiment_type.table_name,
            columns = experiment_type.schema_definition.len(),
            "registered"
        );
    }
    Ok(())
}

fn main() {
    let file = std::env::args().nth(1).map(PathBuf::from);
    let settings = match Settings::load(file.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    init_logging(&settings);
    if let Err(e) = run(&settings) {
        error!(kind = e.kind(), error = %e, "start-up failed");
        std::process::exit(1);
    }
}
