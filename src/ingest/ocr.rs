use async_trait::async_trait;
use image::{ ImageFormat, Luma, GrayImage };
use log::{ debug, error, info };
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cli::Args;
use crate::error::{ ChatError, ChatResult };

/// Pixels whose channel mean is above this become white, the rest black.
pub const THRESHOLD: u8 = 128;

pub const DEFAULT_WHITELIST: &str =
    "0123456789+-=?ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!@#$%^&*()_[]{}|;:,.<>~";

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image_bytes: &[u8]) -> ChatResult<String>;
}

/// Grayscale by channel mean, then a hard black/white threshold. Returns PNG bytes.
pub fn preprocess(image_bytes: &[u8]) -> ChatResult<Vec<u8>> {
    let decoded = image
        ::load_from_memory(image_bytes)
        .map_err(|e| ChatError::Ocr(format!("could not decode image: {}", e)))?
        .to_rgb8();

    let (width, height) = decoded.dimensions();
    let mut out = GrayImage::new(width, height);
    for (x, y, pixel) in decoded.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let avg = ((r as u16) + (g as u16) + (b as u16)) / 3;
        let value = if avg > (THRESHOLD as u16) { 255 } else { 0 };
        out.put_pixel(x, y, Luma([value]));
    }

    let mut png = Vec::new();
    out
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ChatError::Ocr(format!("could not encode image: {}", e)))?;
    Ok(png)
}

/// Runs the `tesseract` binary, feeding the preprocessed image on stdin.
pub struct TesseractOcr {
    binary: String,
    lang: String,
    whitelist: String,
}

impl TesseractOcr {
    pub fn new(binary: &str, lang: &str) -> Self {
        Self {
            binary: binary.to_string(),
            lang: lang.to_string(),
            whitelist: DEFAULT_WHITELIST.to_string(),
        }
    }

    pub fn with_whitelist(mut self, whitelist: &str) -> Self {
        self.whitelist = whitelist.to_string();
        self
    }

    pub fn from_args(args: &Args) -> Self {
        let engine = Self::new(&args.tesseract_bin, &args.ocr_lang);
        match &args.ocr_whitelist {
            Some(whitelist) => engine.with_whitelist(whitelist),
            None => engine,
        }
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.lang.clone(),
            "--psm".to_string(),
            "3".to_string()
        ];
        if !self.whitelist.is_empty() {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={}", self.whitelist));
        }
        args
    }
}

pub fn create_ocr_engine(args: &Args) -> Arc<dyn OcrEngine> {
    info!("OCR via '{}' (lang {})", args.tesseract_bin, args.ocr_lang);
    Arc::new(TesseractOcr::from_args(args))
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image_bytes: &[u8]) -> ChatResult<String> {
        let png = preprocess(image_bytes)?;

        let mut child = Command::new(&self.binary)
            .args(self.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChatError::Ocr(format!("failed to start '{}': {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("tesseract exited with {}: {}", output.status, stderr.trim());
            return Err(ChatError::Ocr(format!("tesseract exited with {}", output.status)));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("OCR recognised {} characters", text.chars().count());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use image::{ Rgb, RgbImage };

    fn encode(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn preprocessing_thresholds_on_channel_mean() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, Rgb([200, 200, 200]));
        img.put_pixel(1, 0, Rgb([128, 128, 128]));
        img.put_pixel(2, 0, Rgb([255, 0, 200])); // mean 151

        let out = image::load_from_memory(&preprocess(&encode(&img)).unwrap()).unwrap().to_luma8();
        assert_eq!(out.get_pixel(0, 0).0, [255]);
        assert_eq!(out.get_pixel(1, 0).0, [0]);
        assert_eq!(out.get_pixel(2, 0).0, [255]);
    }

    #[test]
    fn garbage_is_an_ocr_error() {
        assert!(matches!(preprocess(b"not an image"), Err(ChatError::Ocr(_))));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let mut img = RgbImage::new(1, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        let engine = TesseractOcr::new("/nonexistent/tesseract", "eng");
        assert!(matches!(engine.recognize(&encode(&img)).await, Err(ChatError::Ocr(_))));
    }

    #[test]
    fn whitelist_is_passed_as_config() {
        let args = TesseractOcr::new("tesseract", "deu").with_whitelist("0123").command_args();
        assert_eq!(args[3], "deu");
        assert_eq!(args.last().unwrap(), "tessedit_char_whitelist=0123");
    }

    #[test]
    fn whitelist_flag_reaches_the_command() {
        let args = Args::parse_from(["chatdesk", "--ocr-lang", "deu", "--ocr-whitelist", "0123456789"]);
        let command = TesseractOcr::from_args(&args).command_args();
        assert_eq!(command[3], "deu");
        assert_eq!(command.last().unwrap(), "tessedit_char_whitelist=0123456789");

        let args = Args::parse_from(["chatdesk", "--ocr-whitelist", ""]);
        let command = TesseractOcr::from_args(&args).command_args();
        assert!(!command.iter().any(|a| a.starts_with("tessedit_char_whitelist")));
    }
}
