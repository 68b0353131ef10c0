mod renderer;

use color_eyre::Result;
use std::sync::Arc;
use std::time::Instant;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use hri::renderer::config::RenderConfig;
use crate::app::renderer::DemoRenderer;

pub struct App {
    config: RenderConfig,
    window: Option<Arc<Window>>,
    renderer: Option<DemoRenderer>,
    event_loop: Option<EventLoop<()>>,

    // State
    start_time: Instant,
    paused: bool,
    error: Option<color_eyre::Report>,
}

impl App {
    pub fn new(config: RenderConfig) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);

        Ok(Self {
            config,
            window: None,
            renderer: None,
            event_loop: Some(event_loop),

            start_time: Instant::now(),
            paused: false,
            error: None,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.run_app(self)?;
        }
        // Drop the renderer before the window its surface was created from
        self.renderer = None;

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: impl Into<color_eyre::Report>) {
        let err = err.into();
        log::error!("{err}");
        self.error = Some(err);
        event_loop.exit();
    }

    fn clear_color(&self) -> [f32; 4] {
        let t = self.start_time.elapsed().as_secs_f32();
        [
            0.5 + 0.5 * t.sin(),
            0.5 + 0.5 * (t + 2.0).sin(),
            0.5 + 0.5 * (t + 4.0).sin(),
            1.0,
        ]
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let clear_color = self.clear_color();
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        if let Err(err) = renderer.draw(clear_color) {
            self.fail(event_loop, err);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let attributes = Window::default_attributes().with_title(self.config.app_name.clone());
            match event_loop.create_window(attributes) {
                Ok(window) => self.window = Some(Arc::new(window)),
                Err(err) => return self.fail(event_loop, err),
            }
        }

        if self.renderer.is_none() {
            if let Some(window) = self.window.clone() {
                match DemoRenderer::new(window, &self.config) {
                    Ok(renderer) => self.renderer = Some(renderer),
                    Err(err) => self.fail(event_loop, err),
                }
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.window.as_ref().map(|w| w.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if !self.paused {
                    self.draw(event_loop);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: key,
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => match key.as_ref() {
                Key::Character("p") => {
                    self.paused = !self.paused;
                    log::info!("paused: {}", self.paused);
                }
                Key::Named(NamedKey::Escape) => {
                    event_loop.exit();
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}
