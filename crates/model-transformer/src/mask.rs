//! Маски внимания.
//!
//! Все маски имеют тип u8: 1 = позиция участвует, 0 = замаскирована.

use candle_core::{DType, Device, Result, Tensor};

/// Маска непустых позиций: (batch, 1, max_len).
pub fn non_pad_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| u8::from(t < len)))
        .collect();
    Tensor::from_vec(data, (lengths.len(), 1, max_len), device)
}

/// Нижнетреугольная маска (size, size): позиция i видит 0..=i.
pub fn subsequent_mask(size: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..size)
        .flat_map(|i| (0..size).map(move |j| u8::from(j <= i)))
        .collect();
    Tensor::from_vec(data, (size, size), device)
}

/// Заменить замаскированные (0) позиции на `value`.
pub fn masked_fill(x: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let mask = mask.broadcast_as(x.shape())?;
    let fill = Tensor::new(value, x.device())?
        .to_dtype(x.dtype())?
        .broadcast_as(x.shape())?;
    mask.where_cond(x, &fill)
}

/// Длины по маске (batch, 1, T).
pub fn mask_lengths(mask: &Tensor) -> Result<Vec<usize>> {
    let sums = mask.to_dtype(DType::U32)?.sum_keepdim(2)?.flatten_all()?;
    Ok(sums.to_vec1::<u32>()?.into_iter().map(|v| v as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_pad_mask() {
        let mask = non_pad_mask(&[3, 1], 3, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 3]);
        assert_eq!(
            mask.squeeze(1).unwrap().to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        assert_eq!(mask_lengths(&mask).unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_subsequent_mask() {
        let mask = subsequent_mask(3, &Device::Cpu).unwrap();
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]
        );
    }

    #[test]
    fn test_masked_fill() {
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1]], &Device::Cpu).unwrap();
        let y = masked_fill(&x, &mask, 0.0).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![1.0, 0.0, 3.0]]);
    }
}
