//! Конфигурация эксперимента (YAML-документ рецепта обучения).
//!
//! Документ содержит секции `encoder_conf`, `decoder_conf`, `model_conf`,
//! `collate_conf`, `dataset_conf` и селекторы `encoder` / `decoder`.
//! Разбор идёт только в типизированные структуры данных, поэтому никаких
//! произвольных объектов из YAML не создаётся. Ключи, не нужные для
//! инференса (оптимизатор, dropout, scheduler, ...), молча игнорируются.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AsrError, AsrResult};

/// Полная конфигурация эксперимента.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Тип энкодера (`conformer` по умолчанию).
    #[serde(default)]
    pub encoder: EncoderType,

    /// Тип декодера (поддерживается только `transformer`).
    #[serde(default)]
    pub decoder: DecoderType,

    pub encoder_conf: EncoderConf,

    pub decoder_conf: DecoderConf,

    pub model_conf: ModelConf,

    pub collate_conf: CollateConf,

    #[serde(default)]
    pub dataset_conf: DatasetConf,
}

impl ExperimentConfig {
    /// Прочитать и провалидировать конфигурацию из YAML-файла.
    pub fn from_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AsrError::Config(format!("Не удалось прочитать {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml_str(&text)?;
        debug!("Конфигурация загружена из {}", path.display());
        Ok(config)
    }

    /// Разобрать конфигурацию из строки YAML.
    pub fn from_yaml_str(text: &str) -> AsrResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Проверить сочетания параметров, которые serde проверить не может.
    pub fn validate(&self) -> AsrResult<()> {
        let enc = &self.encoder_conf;
        if enc.attention_heads == 0 || enc.output_size % enc.attention_heads != 0 {
            return Err(AsrError::Config(format!(
                "encoder_conf.output_size={} не делится на attention_heads={}",
                enc.output_size, enc.attention_heads
            )));
        }
        if enc.concat_after || self.decoder_conf.concat_after {
            return Err(AsrError::Config(
                "concat_after=true не поддерживается".to_string(),
            ));
        }
        if self.encoder_conf.self_attention(self.encoder) == SelfAttentionType::RelSelfattn
            && self.encoder_conf.pos_enc(self.encoder) != PosEncType::RelPos
        {
            return Err(AsrError::Config(
                "rel_selfattn требует pos_enc_layer_type=rel_pos".to_string(),
            ));
        }
        if self.encoder == EncoderType::Conformer
            && enc.use_cnn_module
            && enc.cnn_module_kernel % 2 == 0
        {
            return Err(AsrError::Config(format!(
                "cnn_module_kernel={} должен быть нечётным",
                enc.cnn_module_kernel
            )));
        }

        let dec = &self.decoder_conf;
        if dec.attention_heads == 0 || enc.output_size % dec.attention_heads != 0 {
            return Err(AsrError::Config(format!(
                "encoder_conf.output_size={} не делится на decoder_conf.attention_heads={}",
                enc.output_size, dec.attention_heads
            )));
        }

        if self.collate_conf.feature_extraction_conf.using_pitch {
            return Err(AsrError::Config(
                "using_pitch=true не поддерживается".to_string(),
            ));
        }

        let ds = &self.dataset_conf;
        if ds.batch_type == BatchType::Dynamic && ds.max_frames_in_batch == 0 {
            return Err(AsrError::Config(
                "batch_type=dynamic требует max_frames_in_batch > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Селекторы архитектуры
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    #[default]
    Conformer,
    Transformer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderType {
    #[default]
    Transformer,
}

/// Входной слой энкодера (субдискретизация).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayer {
    /// Две Conv2d(3, stride 2): длина уменьшается в 4 раза.
    #[default]
    Conv2d,
    /// Conv2d(3, 2) + Conv2d(5, 3): в 6 раз.
    Conv2d6,
    /// Три Conv2d(3, 2): в 8 раз.
    Conv2d8,
    /// Linear + LayerNorm без субдискретизации.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosEncType {
    AbsPos,
    RelPos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfAttentionType {
    Selfattn,
    RelSelfattn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    Relu,
    Swish,
    Gelu,
    Tanh,
}

// ---------------------------------------------------------------------------
// encoder_conf / decoder_conf / model_conf
// ---------------------------------------------------------------------------

/// Параметры энкодера (общие для Transformer и Conformer).
///
/// Поля, чьё значение по умолчанию зависит от типа энкодера, хранятся как
/// `Option` и разрешаются методами [`EncoderConf::pos_enc`],
/// [`EncoderConf::self_attention`] и [`EncoderConf::activation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConf {
    pub output_size: usize,
    pub attention_heads: usize,
    pub linear_units: usize,
    pub num_blocks: usize,
    pub input_layer: InputLayer,
    pub pos_enc_layer_type: Option<PosEncType>,
    pub selfattention_layer_type: Option<SelfAttentionType>,
    pub normalize_before: bool,
    pub concat_after: bool,
    pub macaron_style: bool,
    pub use_cnn_module: bool,
    pub cnn_module_kernel: usize,
    pub activation_type: Option<ActivationType>,
}

impl Default for EncoderConf {
    fn default() -> Self {
        Self {
            output_size: 256,
            attention_heads: 4,
            linear_units: 2048,
            num_blocks: 6,
            input_layer: InputLayer::Conv2d,
            pos_enc_layer_type: None,
            selfattention_layer_type: None,
            normalize_before: true,
            concat_after: false,
            macaron_style: true,
            use_cnn_module: true,
            cnn_module_kernel: 15,
            activation_type: None,
        }
    }
}

impl EncoderConf {
    /// Тип позиционного кодирования: `rel_pos` для Conformer, `abs_pos` для Transformer.
    pub fn pos_enc(&self, encoder: EncoderType) -> PosEncType {
        self.pos_enc_layer_type.unwrap_or(match encoder {
            EncoderType::Conformer => PosEncType::RelPos,
            EncoderType::Transformer => PosEncType::AbsPos,
        })
    }

    /// Тип self-attention; по умолчанию следует за позиционным кодированием.
    pub fn self_attention(&self, encoder: EncoderType) -> SelfAttentionType {
        self.selfattention_layer_type
            .unwrap_or(match self.pos_enc(encoder) {
                PosEncType::RelPos => SelfAttentionType::RelSelfattn,
                PosEncType::AbsPos => SelfAttentionType::Selfattn,
            })
    }

    /// Активация feed-forward/conv: Transformer всегда использует ReLU.
    pub fn activation(&self, encoder: EncoderType) -> ActivationType {
        match encoder {
            EncoderType::Transformer => ActivationType::Relu,
            EncoderType::Conformer => self.activation_type.unwrap_or(ActivationType::Swish),
        }
    }
}

/// Параметры Transformer-декодера.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConf {
    pub attention_heads: usize,
    pub linear_units: usize,
    pub num_blocks: usize,
    pub normalize_before: bool,
    pub src_attention: bool,
    pub concat_after: bool,
}

impl Default for DecoderConf {
    fn default() -> Self {
        Self {
            attention_heads: 4,
            linear_units: 2048,
            num_blocks: 6,
            normalize_before: true,
            src_attention: true,
            concat_after: false,
        }
    }
}

/// Параметры верхнеуровневой модели (веса лоссов при обучении).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConf {
    pub ctc_weight: f32,
    pub lsm_weight: f32,
    pub length_normalized_loss: bool,
}

impl Default for ModelConf {
    fn default() -> Self {
        Self {
            ctc_weight: 0.5,
            lsm_weight: 0.0,
            length_normalized_loss: false,
        }
    }
}

// ---------------------------------------------------------------------------
// collate_conf / dataset_conf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    #[default]
    Fbank,
}

/// Параметры извлечения fbank-признаков (в миллисекундах для окон).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureExtractionConf {
    pub feature_type: FeatureType,
    pub mel_bins: usize,
    pub frame_shift: f32,
    pub frame_length: f32,
    pub using_pitch: bool,
}

impl Default for FeatureExtractionConf {
    fn default() -> Self {
        Self {
            feature_type: FeatureType::Fbank,
            mel_bins: 80,
            frame_shift: 10.0,
            frame_length: 25.0,
            using_pitch: false,
        }
    }
}

/// Параметры коллатора батчей.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollateConf {
    pub feature_extraction_conf: FeatureExtractionConf,
    /// Амплитуда гауссова dither при извлечении fbank (0 = выключен).
    pub feature_dither: f32,
    pub spec_aug: bool,
    pub speed_perturb: bool,
}

impl CollateConf {
    /// Копия конфигурации для инференса: аугментации выключены.
    pub fn for_inference(&self) -> Self {
        Self {
            spec_aug: false,
            speed_perturb: false,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    /// Фиксированное число высказываний в батче.
    #[default]
    Static,
    /// Батч набирается, пока сумма фреймов не превысит `max_frames_in_batch`.
    Dynamic,
}

/// Параметры датасета.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConf {
    pub max_length: usize,
    pub min_length: usize,
    pub batch_type: BatchType,
    pub batch_size: usize,
    pub max_frames_in_batch: usize,
    pub sort: bool,
    pub raw_wav: bool,
}

impl Default for DatasetConf {
    fn default() -> Self {
        Self {
            max_length: 10240,
            min_length: 0,
            batch_type: BatchType::Static,
            batch_size: 1,
            max_frames_in_batch: 0,
            sort: true,
            raw_wav: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFORMER_YAML: &str = r#"
encoder: conformer
encoder_conf:
    output_size: 256
    attention_heads: 4
    linear_units: 2048
    num_blocks: 12
    dropout_rate: 0.1
    input_layer: conv2d
    normalize_before: true
    cnn_module_kernel: 15
    use_cnn_module: True
    activation_type: 'swish'
    pos_enc_layer_type: 'rel_pos'
    selfattention_layer_type: 'rel_selfattn'

decoder: transformer
decoder_conf:
    attention_heads: 4
    linear_units: 2048
    num_blocks: 6
    dropout_rate: 0.1

model_conf:
    ctc_weight: 0.3
    lsm_weight: 0.1
    length_normalized_loss: false

collate_conf:
    spec_aug: true
    feature_dither: 0.0
    feature_extraction_conf:
        feature_type: 'fbank'
        mel_bins: 80
        frame_shift: 10
        frame_length: 25
        using_pitch: false

dataset_conf:
    max_length: 40960
    min_length: 0
    batch_type: 'static'
    batch_size: 12
    sort: true

optim: adam
optim_conf:
    lr: 0.002
"#;

    #[test]
    fn test_parse_conformer_recipe() {
        let config = ExperimentConfig::from_yaml_str(CONFORMER_YAML).unwrap();
        assert_eq!(config.encoder, EncoderType::Conformer);
        assert_eq!(config.encoder_conf.num_blocks, 12);
        assert_eq!(config.encoder_conf.pos_enc(config.encoder), PosEncType::RelPos);
        assert_eq!(
            config.encoder_conf.self_attention(config.encoder),
            SelfAttentionType::RelSelfattn
        );
        assert_eq!(config.model_conf.ctc_weight, 0.3);
        assert_eq!(config.collate_conf.feature_extraction_conf.mel_bins, 80);
        assert_eq!(config.collate_conf.feature_extraction_conf.frame_shift, 10.0);
        assert_eq!(config.dataset_conf.max_length, 40960);
        assert!(config.collate_conf.spec_aug);
    }

    #[test]
    fn test_transformer_defaults() {
        let yaml = r#"
encoder: transformer
encoder_conf: {}
decoder_conf: {}
model_conf: {}
collate_conf: {}
"#;
        let config = ExperimentConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.encoder_conf.pos_enc(config.encoder), PosEncType::AbsPos);
        assert_eq!(config.encoder_conf.activation(config.encoder), ActivationType::Relu);
        assert_eq!(config.dataset_conf.batch_size, 1);
        assert!(config.dataset_conf.raw_wav);
    }

    #[test]
    fn test_missing_section_is_error() {
        let yaml = "encoder_conf: {}\ndecoder_conf: {}\nmodel_conf: {}\n";
        assert!(ExperimentConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rel_attention_requires_rel_pos() {
        let yaml = r#"
encoder: conformer
encoder_conf:
    pos_enc_layer_type: abs_pos
    selfattention_layer_type: rel_selfattn
decoder_conf: {}
model_conf: {}
collate_conf: {}
"#;
        let err = ExperimentConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AsrError::Config(_)));
    }

    #[test]
    fn test_heads_must_divide_output_size() {
        let yaml = r#"
encoder_conf:
    output_size: 250
    attention_heads: 4
decoder_conf: {}
model_conf: {}
collate_conf: {}
"#;
        assert!(matches!(
            ExperimentConfig::from_yaml_str(yaml),
            Err(AsrError::Config(_))
        ));
    }

    #[test]
    fn test_for_inference_disables_augmentation() {
        let config = ExperimentConfig::from_yaml_str(CONFORMER_YAML).unwrap();
        let conf = config.collate_conf.for_inference();
        assert!(!conf.spec_aug);
        assert!(!conf.speed_perturb);
        assert_eq!(conf.feature_extraction_conf.mel_bins, 80);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        std::fs::write(&path, CONFORMER_YAML).unwrap();
        let config = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(config.decoder_conf.num_blocks, 6);
    }
}
