//! 指数移动平均
//!
//! Queen端用它平滑每个通道的每任务开销估计，避免单次网络抖动左右任务包大小。

/// EMA平滑器，第一个样本直接作为初始值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    /// # 参数
    /// - alpha: 平滑系数(0-1]，越大越偏向新样本
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    /// 加入新样本并返回平滑后的值
    pub fn next(&mut self, sample: f64) -> f64 {
        let value = match self.value {
            None => sample,
            Some(prev) => prev + self.alpha * (sample - prev),
        };
        self.value = Some(value);
        value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
