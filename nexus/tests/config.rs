use std::path::{Path, PathBuf};

use assert_matches::assert_matches;

use nexus::subsys::{CliOverrides, ConfigError, PipelineSpec};

fn config_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/configs")
        .join(name)
}

fn load(name: &str) -> Result<PipelineSpec, ConfigError> {
    PipelineSpec::from_file(&config_path(name))
}

#[test]
fn good_config_builds_the_expected_graph() {
    let spec = load("good_config.yaml").unwrap();
    let actors: Vec<&str> = spec.actors.keys().map(String::as_str).collect();
    assert_eq!(actors, vec!["Acquirer", "Analysis"]);
    assert_eq!(
        spec.connections.get("Acquirer.q_out").unwrap(),
        &vec!["Analysis.q_in".to_string()]
    );
    assert_eq!(spec.settings.store_size(), 40_000_000);
}

#[test]
fn bare_endpoint_names_get_default_ports() {
    let spec = load("simple_graph.yaml").unwrap();
    assert_eq!(
        spec.connections.get("Acquirer.q_out").unwrap(),
        &vec!["Analysis.q_in".to_string()]
    );
}

#[test]
fn cyclic_graphs_are_allowed() {
    let spec = load("cyclic_config.yaml").unwrap();
    assert_eq!(spec.connections.len(), 3);
}

#[test]
fn blank_documents_are_fatal() {
    assert_matches!(
        load("blank_file.yaml"),
        Err(ConfigError::EmptyDocument)
    );
}

#[test]
fn endpoints_must_reference_declared_actors() {
    assert_matches!(
        load("dangling_sink.yaml"),
        Err(ConfigError::UnknownEndpoint { .. })
    );
}

#[test]
fn gui_actors_count_as_declared() {
    let spec = load("with_gui.yaml").unwrap();
    let (gui_name, _) = spec.gui.as_ref().unwrap();
    assert_eq!(gui_name, "FrontEnd");
    assert_eq!(
        spec.connections.get("Acquirer.q_out").unwrap(),
        &vec!["FrontEnd.q_in".to_string()]
    );
}

#[test]
fn cli_ports_override_the_file_only_when_nonzero() {
    let mut spec = load("minimal_with_settings.yaml").unwrap();
    spec.apply_cli(&CliOverrides {
        control_port: 0,
        output_port: 6001,
        store_size: Some(11_000_000),
    });
    // zero CLI loses to the file, non-zero wins, store size is file-first
    assert_eq!(spec.settings.control_port(), 5670);
    assert_eq!(spec.settings.output_port(), 6001);
    assert_eq!(spec.settings.store_size(), 20_000_000);
}

#[test]
fn cli_values_fill_settings_the_file_left_out() {
    let mut spec = load("simple_graph.yaml").unwrap();
    spec.apply_cli(&CliOverrides {
        control_port: 0,
        output_port: 0,
        store_size: Some(11_000_000),
    });
    assert_eq!(spec.settings.control_port(), 0);
    assert_eq!(spec.settings.store_size(), 11_000_000);
}

#[test]
fn link_tuning_must_match_a_connection() {
    let text = "actors:\n  A:\n    package: p\n    classname: C\nlinks:\n  A.q_out:\n    capacity: 8\n";
    assert_matches!(
        PipelineSpec::from_str(text),
        Err(ConfigError::UnknownTunedLink { .. })
    );
}

#[test]
fn watched_actors_must_be_declared() {
    let text = "settings:\n  use_watcher: [Ghost]\nactors:\n  A:\n    package: p\n    classname: C\n";
    assert_matches!(
        PipelineSpec::from_str(text),
        Err(ConfigError::UnknownWatched { .. })
    );
}

#[test]
fn a_pipeline_needs_actors() {
    assert_matches!(
        PipelineSpec::from_str("settings:\n  store_size: 1\n"),
        Err(ConfigError::NoActors)
    );
}

#[test]
fn persistence_conflicts_are_caught_before_spawn() {
    let text = "settings:\n  redis_saving_enabled: false\n  redis_aof_dirname: somewhere\nactors:\n  A:\n    package: p\n    classname: C\n";
    assert_matches!(
        PipelineSpec::from_str(text),
        Err(ConfigError::SavingDisabled)
    );
}
