use std::sync::Arc;

use anyhow::Result;
use log::info;

use veloxdb::config::SessionConfig;
use veloxdb::mock_engine::MockEngine;
use veloxdb::schema::{ClassDef, ModelBuilder, PropertyDef};
use veloxdb::session::ObjectModel;
use veloxdb::value::{DeleteAction, PropertyValue, SimpleKind};

fn init_logging() -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    info!("starting the weather-station walkthrough");
    run()?;
    info!("done");
    Ok(())
}

fn run() -> Result<()> {
    // Reading(2).station is a CascadeDelete reference to Station(1), so
    // deleting a station cascades into every reading that points at it.
    let model = Arc::new(
        ModelBuilder::new()
            .class(
                ClassDef::new(1, "Station")
                    .property(PropertyDef::string("name"))
                    .property(PropertyDef::simple("elevation", SimpleKind::Int)),
            )
            .class(
                ClassDef::new(2, "Reading")
                    .property(PropertyDef::simple("celsius", SimpleKind::Double))
                    .property(PropertyDef::reference("station", 1, DeleteAction::CascadeDelete, true)),
            )
            .build(),
    );

    let engine = MockEngine::new(model.clone());
    let mut session = ObjectModel::open(&engine, model, SessionConfig::default())?;

    let station = session.create_object(1)?;
    session.set(station, 2, PropertyValue::String("Keystone".into()))?;
    session.set(station, 3, PropertyValue::Int(2830))?;

    let reading = session.create_object(2)?;
    session.set(reading, 2, PropertyValue::Double(-4.5))?;
    session.set(reading, 3, PropertyValue::Reference(station))?;

    session.apply_changes()?;
    info!("recorded station {:?} with reading {:?}", station, reading);

    session.delete_object(station, true)?;
    session.apply_changes()?;
    info!("deleting the station cascaded into its readings");

    session.commit()?;
    Ok(())
}