use std::io::Write;
use std::path::Path;

use rl_core::error::TrainerConfigError;
use rl_core::trainers::environment_parameter_manager::SamplerSettings;
use rl_core::trainers::curriculum::MeasureType;
use rl_core::RunOptions;

#[test]
fn test_deserialize_run_options() {
    let yaml_str = r#"
        behaviors:
          default:
            trainer_type: ppo
            max_steps: 1000
          Striker:
            trainer_type: sac
            time_horizon: 32
            hyperparameters:
              batch_size: 64
              buffer_init_steps: 100
          Goalie: Striker
        environment_parameters:
          gravity:
            sampler_type: uniform
            min_value: 7.0
            max_value: 12.0
        resampling_interval: 5000
        demo_path: demos/Striker.demo
        curriculum:
          Striker:
            measure: reward
            thresholds: [0.5, 0.8]
            min_lesson_length: 10
            parameters:
              goal_size: [4.0, 3.0, 2.0]
        checkpoint_settings:
          run_id: soccer
          save_freq: 2000
          keep_checkpoints: 3
        env_settings:
          seed: 42
          agents_per_behavior: 4
    "#;
    let options: RunOptions = serde_yaml::from_str(yaml_str).unwrap();
    assert_eq!(
        options.brain_names(),
        vec!["Striker".to_string(), "Goalie".to_string()]
    );
    assert_eq!(options.resampling_interval, Some(5000));
    assert_eq!(options.demo_path.as_deref(), Some(Path::new("demos/Striker.demo")));
    assert_eq!(
        options.environment_parameters["gravity"],
        SamplerSettings::Uniform {
            min_value: 7.0,
            max_value: 12.0
        }
    );
    let curriculum = &options.curriculum["Striker"];
    assert_eq!(curriculum.measure, MeasureType::Reward);
    assert_eq!(curriculum.min_lesson_length, 10);
    assert!(curriculum.signal_smoothing);
    assert_eq!(options.checkpoint_settings.run_id, "soccer");
    assert_eq!(options.checkpoint_settings.save_freq, 2000);
    assert!(!options.checkpoint_settings.resume);
    assert_eq!(options.env_settings.seed, 42);
    assert_eq!(options.env_settings.steps_per_advance, 1);
}

#[test]
fn test_paths_derive_from_run_id() {
    let mut options = RunOptions::default();
    options.checkpoint_settings.results_dir = "out".into();
    options.checkpoint_settings.run_id = "walker".into();
    options.checkpoint_settings.initialize_from = Some("crawler".into());
    let checkpoint = &options.checkpoint_settings;
    assert_eq!(checkpoint.model_path(), std::path::Path::new("out/walker"));
    assert_eq!(
        checkpoint.run_logs_dir(),
        std::path::Path::new("out/walker/run_logs")
    );
    assert_eq!(
        checkpoint.init_path().unwrap(),
        std::path::Path::new("out/crawler")
    );
}

#[test]
fn test_from_yaml_reports_parse_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "behaviors: [not, a, mapping").unwrap();
    assert!(matches!(
        RunOptions::from_yaml(file.path()),
        Err(TrainerConfigError::Parse { .. })
    ));
}
