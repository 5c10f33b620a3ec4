//!
//! CLI батчевого распознавания: список данных → модель → файл `<key> <text>`.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use asr_core::{DecodeMode, DecodeOptions, ExperimentConfig};
use asr_dataset::{AudioDataset, CollateFunc, DataLoader};
use asr_pipeline::{InferencePipeline, ResultWriter, Vocabulary};
use audio::GlobalCmvn;
use model_transformer::load_checkpoint;

/// Алгоритм декодирования для CLI.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ModeArg {
    /// Beam search по attention-декодеру
    Attention,
    /// Жадный CTC-поиск
    #[value(name = "ctc_greedy_search")]
    CtcGreedySearch,
}

impl From<ModeArg> for DecodeMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Attention => DecodeMode::Attention,
            ModeArg::CtcGreedySearch => DecodeMode::CtcGreedySearch,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "recognize")]
#[command(author, version, about = "Recognize with your model", long_about = None)]
struct Cli {
    /// Config file (YAML)
    #[arg(long)]
    config: PathBuf,

    /// Test data list file
    #[arg(long = "test_data")]
    test_data: PathBuf,

    /// GPU id; -1 means CPU
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    gpu: i32,

    /// Checkpoint for the model
    #[arg(long)]
    checkpoint: PathBuf,

    /// Global CMVN stats (JSON или матрица Kaldi)
    #[arg(long)]
    cmvn: Option<PathBuf>,

    /// Dict file: `<unit> <id>` per line
    #[arg(long)]
    dict: PathBuf,

    /// Beam size for search
    #[arg(long = "beam_size", default_value_t = 10)]
    beam_size: usize,

    /// Length penalty
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    penalty: f32,

    /// ASR result file
    #[arg(long = "result_file")]
    result_file: PathBuf,

    /// Batch size (переопределяет `dataset_conf.batch_size`)
    #[arg(long = "batch_size", default_value_t = 16)]
    batch_size: usize,

    /// Decoding mode
    #[arg(long, value_enum, default_value = "attention")]
    mode: ModeArg,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    let start = Instant::now();

    let mut config = ExperimentConfig::from_file(&cli.config)
        .with_context(|| format!("Не удалось загрузить конфиг {}", cli.config.display()))?;
    // При распознавании порядок списка сохраняется, размер батча задаёт CLI.
    config.dataset_conf.sort = false;
    config.dataset_conf.batch_size = cli.batch_size;

    let mel_bins = config.collate_conf.feature_extraction_conf.mel_bins;
    let dataset = AudioDataset::new(&cli.test_data, &config.dataset_conf, mel_bins)
        .with_context(|| format!("Не удалось прочитать список {}", cli.test_data.display()))?;
    info!(
        "Датасет: {} высказываний, {} батчей, input_dim={}",
        dataset.num_utterances(),
        dataset.len(),
        dataset.input_dim()
    );

    let cmvn = cli
        .cmvn
        .as_ref()
        .map(|path| {
            GlobalCmvn::from_file(path)
                .with_context(|| format!("Не удалось загрузить CMVN {}", path.display()))
        })
        .transpose()?;
    let collate = CollateFunc::new(
        config.collate_conf.clone(),
        cmvn,
        config.dataset_conf.raw_wav,
    );

    let vocab = Vocabulary::from_file(&cli.dict)
        .with_context(|| format!("Не удалось загрузить словарь {}", cli.dict.display()))?;
    let vocab_size = match dataset.output_dim() {
        Some(dim) => {
            if dim != vocab.len() {
                warn!(
                    "Размер выхода в списке данных ({dim}) не совпадает с размером словаря ({})",
                    vocab.len()
                );
            }
            dim
        }
        None => vocab.len(),
    };

    let device = create_device(cli.gpu)?;
    info!("Устройство: {:?}", device);

    let mode = DecodeMode::from(cli.mode);
    if mode == DecodeMode::Attention && config.model_conf.ctc_weight >= 1.0 {
        warn!("ctc_weight = 1.0: attention-декодер не обучался, результаты могут быть пустыми");
    }

    let model = load_checkpoint(
        &config,
        dataset.input_dim(),
        vocab_size,
        &cli.checkpoint,
        &device,
    )
    .with_context(|| format!("Не удалось загрузить чекпойнт {}", cli.checkpoint.display()))?;

    let options = DecodeOptions::default()
        .with_mode(mode)
        .with_beam_size(cli.beam_size)
        .with_penalty(cli.penalty);
    let pipeline = InferencePipeline::new(&model, &vocab, device, options);

    let mut writer = ResultWriter::create(&cli.result_file)?;
    let stats = pipeline.run(DataLoader::new(&dataset, &collate), &mut writer)?;
    writer
        .finish()
        .with_context(|| format!("Не удалось записать {}", cli.result_file.display()))?;

    info!(
        "Готово: {} высказываний → {} ({:.2}с)",
        stats.utterances,
        cli.result_file.display(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

/// `gpu < 0` → CPU; иначе CUDA с откатом на CPU.
fn create_device(gpu: i32) -> Result<Device> {
    let Ok(ordinal) = usize::try_from(gpu) else {
        return Ok(Device::Cpu);
    };
    match Device::cuda_if_available(ordinal) {
        Ok(device) if device.is_cuda() => Ok(device),
        Ok(device) => {
            warn!("CUDA недоступна, используем CPU");
            Ok(device)
        }
        Err(e) => {
            warn!("Не удалось открыть CUDA:{ordinal} ({e}), используем CPU");
            Ok(Device::Cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    use model_transformer::AsrModel;

    const REQUIRED: [&str; 11] = [
        "recognize",
        "--config",
        "train.yaml",
        "--test_data",
        "data.list",
        "--checkpoint",
        "final.pt",
        "--dict",
        "units.txt",
        "--result_file",
        "text",
    ];

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cli.gpu, -1);
        assert_eq!(cli.beam_size, 10);
        assert_eq!(cli.penalty, 0.0);
        assert_eq!(cli.batch_size, 16);
        assert_eq!(cli.mode, ModeArg::Attention);
        assert!(cli.cmvn.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--gpu",
            "0",
            "--beam_size",
            "4",
            "--penalty",
            "-0.5",
            "--mode",
            "ctc_greedy_search",
            "--cmvn",
            "global_cmvn",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.gpu, 0);
        assert_eq!(cli.beam_size, 4);
        assert_eq!(cli.penalty, -0.5);
        assert_eq!(DecodeMode::from(cli.mode), DecodeMode::CtcGreedySearch);
        assert_eq!(cli.cmvn, Some(PathBuf::from("global_cmvn")));
    }

    #[test]
    fn test_missing_required() {
        assert!(Cli::try_parse_from(["recognize", "--config", "train.yaml"]).is_err());
    }

    #[test]
    fn test_negative_gpu_is_cpu() {
        assert!(create_device(-1).unwrap().is_cpu());
    }

    const INPUT_DIM: usize = 20;
    const OUTPUT_DIM: usize = 12;

    const CONFIG_YAML: &str = r#"
encoder: conformer
encoder_conf:
    output_size: 8
    attention_heads: 2
    linear_units: 16
    num_blocks: 1
    input_layer: conv2d
    cnn_module_kernel: 3
decoder_conf:
    attention_heads: 2
    linear_units: 16
    num_blocks: 1
model_conf:
    ctc_weight: 0.3
collate_conf:
    feature_extraction_conf:
        mel_bins: 80
dataset_conf:
    batch_size: 1
    sort: true
    raw_wav: false
"#;

    /// Записать матрицы в бинарный ark; вернуть строки списка данных.
    fn write_feats(ark: &Path, utts: &[(&str, usize)]) -> Vec<String> {
        let mut file = std::fs::File::create(ark).unwrap();
        let mut offset = 0usize;
        let mut lines = Vec::new();
        for (u, &(key, frames)) in utts.iter().enumerate() {
            let mut bytes = format!("{key} ").into_bytes();
            let start = offset + bytes.len();
            bytes.extend_from_slice(b"\0BFM ");
            for dim in [frames as i32, INPUT_DIM as i32] {
                bytes.push(4);
                bytes.extend_from_slice(&dim.to_le_bytes());
            }
            for i in 0..frames * INPUT_DIM {
                let v = ((i + u) % 7) as f32 * 0.1;
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            file.write_all(&bytes).unwrap();
            offset += bytes.len();
            lines.push(format!(
                "utt:{key}\tfeat:{}:{start}\tfeat_shape:{frames},{INPUT_DIM}\ttext:a\ttoken:a\ttokenid:2\ttoken_shape:1,{OUTPUT_DIM}",
                ark.display()
            ));
        }
        lines
    }

    #[test]
    fn test_run_writes_one_line_per_utterance_in_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| dir.path().join(name);

        std::fs::write(path("train.yaml"), CONFIG_YAML).unwrap();
        let config = ExperimentConfig::from_yaml_str(CONFIG_YAML).unwrap();

        // Без sort=false порядок стал бы utt_b, utt_c, utt_a.
        let utts = [("utt_a", 40), ("utt_b", 20), ("utt_c", 30)];
        let lines = write_feats(&path("feats.ark"), &utts);
        std::fs::write(path("data.list"), lines.join("\n") + "\n").unwrap();

        // Словарь на одну единицу больше выхода модели: размер берётся из списка.
        let dict: String = (0..=OUTPUT_DIM).map(|i| format!("u{i} {i}\n")).collect();
        std::fs::write(path("units.txt"), dict).unwrap();

        let mean_stat = vec![0.0f32; INPUT_DIM];
        let var_stat = vec![10.0f32; INPUT_DIM];
        std::fs::write(
            path("global_cmvn"),
            format!(
                "{{\"mean_stat\": {mean_stat:?}, \"var_stat\": {var_stat:?}, \"frame_num\": 10}}"
            ),
        )
        .unwrap();

        let (_model, varmap) =
            AsrModel::random(&config, INPUT_DIM, OUTPUT_DIM, &Device::Cpu).unwrap();
        varmap.save(path("final.safetensors")).unwrap();

        let cli = Cli {
            config: path("train.yaml"),
            test_data: path("data.list"),
            gpu: -1,
            checkpoint: path("final.safetensors"),
            cmvn: Some(path("global_cmvn")),
            dict: path("units.txt"),
            beam_size: 2,
            penalty: 0.0,
            result_file: path("text"),
            batch_size: 2,
            mode: ModeArg::Attention,
        };
        run(cli).unwrap();

        let result = std::fs::read_to_string(path("text")).unwrap();
        assert!(result.ends_with('\n'));
        let keys: Vec<&str> = result
            .lines()
            .map(|line| line.split_once(' ').map_or(line, |(key, _)| key))
            .collect();
        assert_eq!(keys, vec!["utt_a", "utt_b", "utt_c"]);
        assert!(result.lines().all(|line| line.contains(' ')));
    }

    #[test]
    fn test_run_missing_checkpoint_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| dir.path().join(name);
        std::fs::write(path("train.yaml"), CONFIG_YAML).unwrap();
        let lines = write_feats(&path("feats.ark"), &[("utt_a", 16)]);
        std::fs::write(path("data.list"), lines.join("\n")).unwrap();
        let dict: String = (0..OUTPUT_DIM).map(|i| format!("u{i} {i}\n")).collect();
        std::fs::write(path("units.txt"), dict).unwrap();

        let cli = Cli {
            config: path("train.yaml"),
            test_data: path("data.list"),
            gpu: -1,
            checkpoint: path("missing.pt"),
            cmvn: None,
            dict: path("units.txt"),
            beam_size: 10,
            penalty: 0.0,
            result_file: path("text"),
            batch_size: 16,
            mode: ModeArg::CtcGreedySearch,
        };
        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("missing.pt"));
    }
}
