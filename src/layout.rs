use serde::{Deserialize, Serialize};

use crate::{probe::VideoMetadata, timeline::{fmt_num, TimelineSegment}};

/// The editor project, as it arrives in `/video/editor/process`. Only the timeline
/// and layout-relevant fields are modeled; everything else a full config normalizer
/// would validate is out of scope for this service.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub output_width: Option<u32>,
    #[serde(default)]
    pub output_height: Option<u32>,
    #[serde(default)]
    pub background: Option<BackgroundConfig>,
    #[serde(default)]
    pub border_radius: f64,
    #[serde(default)]
    pub shadow: Option<ShadowConfig>,
    #[serde(default)]
    pub padding: f64,
    /// Optional second video input (camera overlay) vstacked onto the decoded frame
    /// before compositing. Positioned per the geometry this module derives below;
    /// it does not re-derive a full external render-spec.
    #[serde(default)]
    pub camera_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    pub segments: Vec<TimelineSegment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackgroundConfig {
    Color { color: u32, #[serde(default = "default_alpha")] alpha: f64 },
    Gradient { from: [u8; 3], to: [u8; 3], angle: f64 },
    Image { path: String },
}

fn default_alpha() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub offset_y: f64,
    #[serde(default)]
    pub blur: f64,
    #[serde(default)]
    pub spread: f64,
    #[serde(default = "default_shadow_opacity")]
    pub opacity: f64,
}

fn default_shadow_opacity() -> f64 {
    0.5
}

/// The derived layout description consumed by the filter-graph builder. In the
/// original system this is produced by an external `computeRenderSpec` pure function;
/// here it is computed in-crate since there is no JS runtime to call out to.
#[derive(Debug, Clone, Serialize)]
pub struct RenderLayout {
    pub output_width: u32,
    pub output_height: u32,
    pub inner_width: u32,
    pub inner_height: u32,
    pub border_radius: f64,
    pub shadow: Shadow,
    pub background_color: u32,
    pub background_color_alpha: f64,
    pub background_gradient: Option<Gradient>,
    pub background_image_path: Option<String>,
    pub should_apply: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Shadow {
    pub enabled: bool,
    pub offset_y: f64,
    pub blur: f64,
    pub spread: f64,
    pub opacity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Gradient {
    pub from: [u8; 3],
    pub to: [u8; 3],
    pub angle: f64,
}

fn even_floor(v: u32) -> u32 {
    if v % 2 == 0 {
        v.max(2)
    } else {
        (v - 1).max(2)
    }
}

/// Derives a `RenderLayout` from the project config and the probed source dimensions.
/// When the config specifies no canvas resize, no background, no rounding, and no
/// shadow, `should_apply` is false and the layout is the source frame identity-wise.
pub fn compute_render_layout(config: &ProjectConfig, source: &VideoMetadata) -> RenderLayout {
    let output_width = even_floor(config.output_width.unwrap_or(source.width as u32));
    let output_height = even_floor(config.output_height.unwrap_or(source.height as u32));

    let has_background = config.background.is_some();
    let has_shadow = config.shadow.map(|s| s.enabled).unwrap_or(false);
    let resized = output_width != even_floor(source.width as u32) || output_height != even_floor(source.height as u32);
    let should_apply = has_background || has_shadow || config.border_radius > 0.0 || resized;

    let padding = config.padding.max(0.0);
    let inner_width = even_floor((output_width as f64 - 2.0 * padding).max(2.0) as u32);
    let inner_height = even_floor((output_height as f64 - 2.0 * padding).max(2.0) as u32);

    let (background_color, background_color_alpha, background_gradient, background_image_path) =
        match &config.background {
            Some(BackgroundConfig::Color { color, alpha }) => (*color, *alpha, None, None),
            Some(BackgroundConfig::Gradient { from, to, angle }) => (
                0x000000,
                1.0,
                Some(Gradient { from: *from, to: *to, angle: *angle }),
                None,
            ),
            Some(BackgroundConfig::Image { path }) => (0x000000, 1.0, None, Some(path.clone())),
            None => (0x000000, 0.0, None, None),
        };

    let shadow = config
        .shadow
        .map(|s| Shadow {
            enabled: s.enabled,
            offset_y: s.offset_y,
            blur: s.blur,
            spread: s.spread,
            opacity: s.opacity,
        })
        .unwrap_or(Shadow { enabled: false, offset_y: 0.0, blur: 0.0, spread: 0.0, opacity: 0.0 });

    RenderLayout {
        output_width,
        output_height,
        inner_width,
        inner_height,
        border_radius: config.border_radius.max(0.0),
        shadow,
        background_color,
        background_color_alpha,
        background_gradient,
        background_image_path,
        should_apply,
    }
}

/// Blur radius ffmpeg's `boxblur` expects: `max(1, round(blur/4))`.
fn boxblur_radius(blur: f64) -> i64 {
    ((blur / 4.0).round() as i64).max(1)
}

/// Builds the background + inner-card + rounded-mask + drop-shadow overlay graph. Only
/// called when `layout.should_apply` is true. `video_label` is the already-filtered
/// video stream label (e.g. `[vout]` from the timeline builder) to composite onto the
/// background.
pub fn build_layout_graph(layout: &RenderLayout, video_label: &str, duration: f64) -> String {
    let w = layout.output_width;
    let h = layout.output_height;
    let mut parts = Vec::new();

    if let Some(path) = &layout.background_image_path {
        parts.push(format!(
            "movie={path},scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}[bg]"
        ));
    } else if let Some(grad) = &layout.background_gradient {
        let angle_rad = grad.angle.to_radians();
        let (dx, dy) = (angle_rad.cos(), angle_rad.sin());
        let expr = format!(
            "max(0,min(1,(X/{w}*{dx}+Y/{h}*{dy}+1)/2))",
            dx = fmt_num(dx),
            dy = fmt_num(dy),
        );
        parts.push(format!(
            "nullsrc=s={w}x{h}:d={duration},format=rgba,geq=r='{r0}+({r1}-{r0})*{expr}':g='{g0}+({g1}-{g0})*{expr}':b='{b0}+({b1}-{b0})*{expr}'[bg]",
            duration = fmt_num(duration),
            r0 = grad.from[0], r1 = grad.to[0],
            g0 = grad.from[1], g1 = grad.to[1],
            b0 = grad.from[2], b1 = grad.to[2],
            expr = expr,
        ));
    } else {
        let rgb = layout.background_color;
        parts.push(format!(
            "color=c=0x{rgb:06x}@{alpha}:s={w}x{h}:d={duration}[bg]",
            alpha = fmt_num(layout.background_color_alpha),
            duration = fmt_num(duration),
        ));
    }

    parts.push(format!(
        "{video_label}scale={iw}:{ih}:force_original_aspect_ratio=decrease,pad={iw}:{ih}:(ow-iw)/2:(oh-ih)/2[vscaled]",
        iw = layout.inner_width,
        ih = layout.inner_height,
    ));

    let card_label = if layout.border_radius > 0.0 {
        parts.push(format!(
            "[vscaled]format=rgba,geq=r='r(X,Y)':g='g(X,Y)':b='b(X,Y)':a='if(lt(X,{rad})*lt(Y,{rad}),if(lte(hypot({rad}-X,{rad}-Y),{rad}),255,0),if(gt(X,{iw}-{rad})*lt(Y,{rad}),if(lte(hypot(X-({iw}-{rad}),{rad}-Y),{rad}),255,0),if(lt(X,{rad})*gt(Y,{ih}-{rad}),if(lte(hypot({rad}-X,Y-({ih}-{rad})),{rad}),255,0),if(gt(X,{iw}-{rad})*gt(Y,{ih}-{rad}),if(lte(hypot(X-({iw}-{rad}),Y-({ih}-{rad})),{rad}),255,0),255))))'[vrounded]",
            rad = fmt_num(layout.border_radius),
            iw = layout.inner_width,
            ih = layout.inner_height,
        ));
        "[vrounded]"
    } else {
        "[vscaled]"
    };

    if layout.shadow.enabled {
        let blur = boxblur_radius(layout.shadow.blur);
        parts.push(format!("{card_label}split=2[vmain][vshadowsrc]"));
        parts.push("[vshadowsrc]alphaextract[ashadow]".to_string());
        for _ in 0..(layout.shadow.spread.max(0.0).round() as i64) {
            parts.push("[ashadow]dilation[ashadow]".to_string());
        }
        parts.push(format!("[ashadow]boxblur={blur}[ashadowblur]"));
        parts.push(format!(
            "color=c=black@{opacity}:s={iw}x{ih}[shadowplate]",
            opacity = fmt_num(layout.shadow.opacity),
            iw = layout.inner_width,
            ih = layout.inner_height,
        ));
        parts.push("[shadowplate][ashadowblur]alphamerge[shadowcard]".to_string());
        parts.push(format!(
            "[bg][shadowcard]overlay=(W-w)/2:(H-h)/2+{offset}[bgshadow]",
            offset = fmt_num(layout.shadow.offset_y),
        ));
        parts.push("[bgshadow][vmain]overlay=(W-w)/2:(H-h)/2[vout_layout]".to_string());
    } else {
        parts.push(format!("[bg]{card_label}overlay=(W-w)/2:(H-h)/2[vout_layout]"));
    }

    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(width: i64, height: i64) -> VideoMetadata {
        VideoMetadata {
            duration: 10.0,
            width,
            height,
            fps: 30.0,
            video_codec: "h264".into(),
            audio_codec: Some("aac".into()),
            audio_channels: Some(2),
            sample_rate: Some(48000),
            bitrate: Some(1_000_000),
            file_size: Some(1_000_000),
        }
    }

    fn bare_config() -> ProjectConfig {
        ProjectConfig {
            timeline: TimelineConfig { segments: vec![] },
            output_width: None,
            output_height: None,
            background: None,
            border_radius: 0.0,
            shadow: None,
            padding: 0.0,
            camera_url: None,
        }
    }

    #[test]
    fn identity_layout_does_not_apply() {
        let layout = compute_render_layout(&bare_config(), &metadata(1920, 1080));
        assert!(!layout.should_apply);
        assert_eq!(layout.output_width, 1920);
        assert_eq!(layout.output_height, 1080);
    }

    #[test]
    fn background_forces_apply_and_even_dimensions() {
        let mut config = bare_config();
        config.output_width = Some(721);
        config.output_height = Some(481);
        config.background = Some(BackgroundConfig::Color { color: 0x112233, alpha: 1.0 });
        let layout = compute_render_layout(&config, &metadata(1920, 1080));
        assert!(layout.should_apply);
        assert_eq!(layout.output_width % 2, 0);
        assert_eq!(layout.output_height % 2, 0);
    }

    #[test]
    fn padding_shrinks_inner_rect() {
        let mut config = bare_config();
        config.output_width = Some(1000);
        config.output_height = Some(1000);
        config.padding = 50.0;
        config.background = Some(BackgroundConfig::Color { color: 0, alpha: 1.0 });
        let layout = compute_render_layout(&config, &metadata(1920, 1080));
        assert!(layout.inner_width < layout.output_width);
        assert!(layout.inner_height < layout.output_height);
    }

    #[test]
    fn solid_background_graph_includes_color_and_overlay() {
        let mut config = bare_config();
        config.background = Some(BackgroundConfig::Color { color: 0xff00ff, alpha: 0.5 });
        let layout = compute_render_layout(&config, &metadata(640, 360));
        let graph = build_layout_graph(&layout, "[vout]", 5.0);
        assert!(graph.contains("color=c=0xff00ff@0.5"));
        assert!(graph.contains("overlay=(W-w)/2:(H-h)/2[vout_layout]"));
    }

    #[test]
    fn shadow_enabled_emits_blur_and_merge_chain() {
        let mut config = bare_config();
        config.background = Some(BackgroundConfig::Color { color: 0, alpha: 1.0 });
        config.shadow = Some(ShadowConfig { enabled: true, offset_y: 4.0, blur: 20.0, spread: 2.0, opacity: 0.6 });
        let layout = compute_render_layout(&config, &metadata(640, 360));
        let graph = build_layout_graph(&layout, "[vout]", 5.0);
        assert!(graph.contains("boxblur=5"));
        assert!(graph.contains("alphamerge"));
        assert_eq!(graph.matches("dilation").count(), 2);
    }

    #[test]
    fn rounded_corners_emit_geq_mask() {
        let mut config = bare_config();
        config.background = Some(BackgroundConfig::Color { color: 0, alpha: 1.0 });
        config.border_radius = 12.0;
        let layout = compute_render_layout(&config, &metadata(640, 360));
        let graph = build_layout_graph(&layout, "[vout]", 5.0);
        assert!(graph.contains("[vrounded]"));
    }
}
