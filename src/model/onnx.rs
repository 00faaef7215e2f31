// 该文件是 Shouye （守夜） 项目的一部分。
// src/model/onnx.rs - ONNX 推理后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ndarray::{ArrayD, IxDyn};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::model::ClassifierBackend;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum OnnxClassifierError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("ONNX 运行时错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("输入形状错误: {0}")]
  InputShapeError(String),
  #[error("模型没有名为 {0} 的输出")]
  OutputMissing(String),
  #[error("模型输出形状错误: 期望 2 个分数, 实际 {0}")]
  OutputShapeError(usize),
}

/// ONNX 分类器构建器
///
/// URL 形如 `onnx:///path/to/model.onnx?input=input&output=output`，
/// 查询参数覆盖模型输入/输出张量名。
pub struct OnnxClassifierBuilder {
  model_path: String,
  input_name: String,
  output_name: String,
}

impl FromUrlWithScheme for OnnxClassifierBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxClassifierBuilder {
  type Error = OnnxClassifierError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OnnxClassifierError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut input_name = "input".to_string();
    let mut output_name = "output".to_string();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "input" => input_name = value.into_owned(),
        "output" => output_name = value.into_owned(),
        _ => {}
      }
    }

    Ok(OnnxClassifierBuilder {
      model_path: url.path().to_string(),
      input_name,
      output_name,
    })
  }
}

impl OnnxClassifierBuilder {
  pub fn build(self) -> Result<OnnxClassifier, OnnxClassifierError> {
    info!("加载模型文件: {}", self.model_path);
    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .commit_from_file(&self.model_path)?;
    info!("模型加载完成");

    Ok(OnnxClassifier {
      session,
      input_name: self.input_name,
      output_name: self.output_name,
    })
  }
}

/// 基于 ONNX Runtime 的分类后端
///
/// 输入 `[1, T, H, W, 3]` f32，输出二元分数；
/// logits 与概率的归一化由适配层负责。
pub struct OnnxClassifier {
  session: Session,
  input_name: String,
  output_name: String,
}

impl ClassifierBackend for OnnxClassifier {
  type Error = OnnxClassifierError;

  fn run(&mut self, input: &[f32], shape: &[usize; 5]) -> Result<[f32; 2], Self::Error> {
    debug!("设置模型输入 {:?}", shape);
    let array = ArrayD::from_shape_vec(IxDyn(shape), input.to_vec())
      .map_err(|e| OnnxClassifierError::InputShapeError(e.to_string()))?;
    let tensor = Tensor::from_array(array)?;

    debug!("执行模型推理");
    let input_name = self.input_name.clone();
    let outputs = self.session.run(ort::inputs![input_name.as_str() => tensor])?;

    let output = outputs
      .get(self.output_name.as_str())
      .ok_or_else(|| OnnxClassifierError::OutputMissing(self.output_name.clone()))?;
    let scores: ndarray::ArrayViewD<f32> = output.try_extract_array()?;

    let flat: Vec<f32> = scores.iter().copied().collect();
    if flat.len() != 2 {
      return Err(OnnxClassifierError::OutputShapeError(flat.len()));
    }

    debug!("模型推理结果: {:?}", flat);
    Ok([flat[0], flat[1]])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_parses_path_and_tensor_names() {
    let url = Url::parse("onnx:///models/seizure.onnx?input=frames&output=scores").unwrap();
    let builder = OnnxClassifierBuilder::from_url(&url).unwrap();

    assert_eq!(builder.model_path, "/models/seizure.onnx");
    assert_eq!(builder.input_name, "frames");
    assert_eq!(builder.output_name, "scores");
  }

  #[test]
  fn builder_rejects_foreign_scheme() {
    let url = Url::parse("file:///models/seizure.onnx").unwrap();
    assert!(OnnxClassifierBuilder::from_url(&url).is_err());
  }
}
