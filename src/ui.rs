// src/ui.rs

use crate::{
    constants,
    models::{Orientation, Playlist},
    symbols,
    sync::{CycleProgress, PlaybackSink},
    utils,
};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::{sync::Mutex, time::Duration};

pub fn print_header(title: &str) {
    println!("\n{}", "═".repeat(constants::UI_WIDTH));
    println!(" {}", title.cyan().bold());
    println!("{}", "═".repeat(constants::UI_WIDTH));
}

pub fn print_sub_header(title: &str) {
    println!("\n--- {} ---", title.bold());
}

pub fn box_message(title: &str, content: &[&str], color_func: fn(ColoredString) -> ColoredString) {
    println!("\n┌{}┐", "─".repeat(constants::UI_WIDTH - 2));
    println!("  {}", color_func(title.bold()));
    println!("├{}┤", "─".repeat(constants::UI_WIDTH - 2));
    for line in content {
        println!("  {}", line);
    }
    println!("└{}┘", "─".repeat(constants::UI_WIDTH - 2));
}

pub fn new_cycle_progress_bar(total: u64) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{prefix:7.bold.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}/{len:3} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    let pb = ProgressBar::new(total);
    pb.set_style(style);
    pb.set_prefix("同步");
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// 在终端上模拟一块屏幕：打印配对码、等待提示、下载进度和播放列表。
#[derive(Default)]
pub struct ConsolePlayback {
    bar: Mutex<Option<ProgressBar>>,
    last_code: Mutex<Option<String>>,
}

impl ConsolePlayback {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.bar.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pb.finish_and_clear();
        }
    }
}

impl PlaybackSink for ConsolePlayback {
    fn show_pairing_code(&self, code: &str) {
        let mut last = self.last_code.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_deref() == Some(code) {
            return;
        }
        *last = Some(code.to_string());
        drop(last);
        self.finish_bar();

        let line = format!("配对码: {}", code.bold().yellow());
        box_message(
            "设备未配对",
            &[line.as_str(), "请在管理后台输入此配对码完成绑定。"],
            |s| s.yellow(),
        );
    }

    fn show_waiting(&self) {
        self.finish_bar();
        *self.last_code.lock().unwrap_or_else(|e| e.into_inner()) = None;
        println!("{} 设备已配对，等待分配播放列表...", *symbols::INFO);
    }

    fn show_downloading(&self, progress: &CycleProgress) {
        let mut bar = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        let pb = bar.get_or_insert_with(|| new_cycle_progress_bar(progress.total as u64));
        pb.set_length(progress.total as u64);
        pb.set_position(progress.settled() as u64);
        if progress.failed > 0 {
            pb.set_message(format!("{} 个失败", progress.failed).red().to_string());
        }
    }

    fn apply_orientation(&self, orientation: Orientation, rotation_degrees: i32) {
        println!(
            "{} 屏幕方向: {:?}，旋转 {}°",
            *symbols::INFO,
            orientation,
            rotation_degrees
        );
    }

    fn play(&self, playlist: &Playlist) {
        self.finish_bar();
        print_sub_header(&format!("开始播放 ({} 个条目)", playlist.items.len()));
        let pad = playlist.items.len().to_string().len();
        for (i, item) in playlist.items.iter().enumerate() {
            println!(
                "  {} [{}] {:<5} {:>4}s  {}",
                *symbols::PLAY,
                format!("{:<pad$}", i + 1, pad = pad).yellow(),
                format!("{:?}", item.media_type),
                item.duration,
                utils::truncate_text(&item.identity_tail(), 48)
            );
        }
    }

    fn stop(&self) {
        self.finish_bar();
        println!("{} 停止播放", *symbols::WARN);
    }
}
